//! Blocking-socket primitives
//!
//! Everything here is plain blocking I/O: a reuse-addr listener for the
//! accept loop, an available-bytes query used to size read buffers, a
//! two-socket readiness wait for tunnel relaying, and name resolution.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;

/// Floor for every read buffer, in bytes
///
/// Reads are sized by how much the kernel already has buffered, but never
/// below this.
pub const MIN_READ_BUFFER: usize = 8192;

/// Bind a listening socket with `SO_REUSEADDR` set
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;

    Ok(socket.into())
}

/// Number of bytes already buffered by the kernel for this socket
pub fn available_bytes(stream: &TcpStream) -> io::Result<usize> {
    let mut available: libc::c_int = 0;

    let rc = unsafe { libc::ioctl(stream.as_raw_fd(), libc::FIONREAD, &mut available) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(available as usize)
}

/// Best read size for this socket right now
///
/// The kernel's pending-byte count, floored at [`MIN_READ_BUFFER`].
pub fn read_buffer_size(stream: &TcpStream) -> io::Result<usize> {
    Ok(available_bytes(stream)?.max(MIN_READ_BUFFER))
}

/// Block until at least one of two sockets is readable
///
/// Returns readiness flags in argument order. There is no timeout; a
/// hung-up peer surfaces as a readable socket whose read returns zero.
pub fn wait_readable_pair(a: &TcpStream, b: &TcpStream) -> io::Result<(bool, bool)> {
    use libc::{poll, pollfd, POLLIN};

    let mut fds = [
        pollfd {
            fd: a.as_raw_fd(),
            events: POLLIN,
            revents: 0,
        },
        pollfd {
            fd: b.as_raw_fd(),
            events: POLLIN,
            revents: 0,
        },
    ];

    let result = unsafe { poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok((fds[0].revents != 0, fds[1].revents != 0))
}

/// Resolve a host name and port to candidate addresses, in resolver order
pub fn resolve(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let addrs = (host, port).to_socket_addrs()?.collect();
    Ok(addrs)
}
