//! Opaque byte tunnel for `CONNECT`
//!
//! After the confirmation line the proxy stops interpreting traffic
//! entirely: whatever arrives on one socket is written verbatim to the
//! other. The loop blocks on a two-socket readiness wait with no timeout,
//! so a silent pair simply parks the thread.

use super::{send_all, RelayStatus, Result};
use crate::net;
use crate::stats::ProxyStats;
use std::io::Read;
use std::net::TcpStream;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

/// Bidirectional passthrough between a client and a `CONNECT` target
pub struct TunnelRelay<'a> {
    client: &'a mut TcpStream,
    upstream: &'a mut TcpStream,
    stats: &'a ProxyStats,
}

impl<'a> TunnelRelay<'a> {
    /// Create a tunnel over an established upstream connection
    pub fn new(
        client: &'a mut TcpStream,
        upstream: &'a mut TcpStream,
        stats: &'a ProxyStats,
    ) -> Self {
        TunnelRelay {
            client,
            upstream,
            stats,
        }
    }

    /// Relay until either side closes
    ///
    /// A zero-byte read on either socket ends the tunnel cleanly; transport
    /// failures are errors.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let (client_ready, upstream_ready) =
                net::wait_readable_pair(self.client, self.upstream)?;

            if client_ready {
                if let RelayStatus::Closed = self.relay_once(Direction::ClientToUpstream)? {
                    debug!("tunnel closed by client");
                    return Ok(());
                }
            }

            if upstream_ready {
                if let RelayStatus::Closed = self.relay_once(Direction::UpstreamToClient)? {
                    debug!("tunnel closed by server");
                    return Ok(());
                }
            }
        }
    }

    /// Move one read's worth of bytes in the given direction
    fn relay_once(&mut self, direction: Direction) -> Result<RelayStatus> {
        let (reader, writer) = match direction {
            Direction::ClientToUpstream => (&mut *self.client, &mut *self.upstream),
            Direction::UpstreamToClient => (&mut *self.upstream, &mut *self.client),
        };

        let size = net::read_buffer_size(reader)?;
        let mut buf = vec![0u8; size];

        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(RelayStatus::Closed);
        }

        match direction {
            Direction::ClientToUpstream => self.stats.add_bytes_in(n as u64),
            Direction::UpstreamToClient => self.stats.add_bytes_out(n as u64),
        }

        send_all(writer, &buf[..n])
    }
}
