//! Forward-proxy relay core
//!
//! One [`RelaySession`] drives a single client connection end to end:
//! it accumulates bytes until a request head parses, rewrites the head for
//! the origin, relays the bodies in both directions with content-length or
//! chunked framing, and keeps both sockets alive across requests when the
//! exchange allows it. `CONNECT` requests switch the session into an opaque
//! [`TunnelRelay`] instead.
//!
//! Everything in this module runs synchronously on the session's own
//! thread; the only shared state is the resolved-address cache and the
//! statistics sink, both injected at construction.

pub mod chunk;
pub mod headers;
pub mod session;
pub mod tunnel;
pub mod upstream;

pub use chunk::ChunkFramer;
pub use headers::{HeaderBlock, Host, Side};
pub use session::RelaySession;
pub use tunnel::TunnelRelay;
pub use upstream::UpstreamResolver;

use std::io::Write;
use std::net::TcpStream;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Relay operation errors
///
/// Incomplete input is never an error: header parsing returns `None` and
/// the chunk framer reads more instead. These variants are the
/// unrecoverable cases that end an exchange.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Resolution failure: {0}")]
    Resolution(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Outcome of a relay step that may close the remote end
///
/// `Closed` is not a failure: it means the peer ended the connection at a
/// point where the protocol allows it, and the caller should wind down
/// instead of erroring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// The connection survived the operation
    Alive,
    /// The connection was closed by the peer or by framing policy
    Closed,
}

/// Default port for plain HTTP targets
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default port for `CONNECT` targets
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Size of each bounded extra read during chunk-size parsing
pub const EXTRA_READ_BYTES: usize = 256;

/// Confirmation sent to the client once a `CONNECT` target is reachable
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// CRLF line ending
pub const CRLF: &str = "\r\n";

/// Write all of `buf` to a socket
///
/// A short write is retried until the buffer is drained. A zero-byte write
/// means the peer dropped the connection and is reported as
/// [`RelayStatus::Closed`]; transport failures are errors.
pub fn send_all(stream: &mut TcpStream, buf: &[u8]) -> Result<RelayStatus> {
    let mut sent = 0;

    while sent < buf.len() {
        let n = stream.write(&buf[sent..])?;
        if n == 0 {
            tracing::warn!("connection unexpectedly dropped mid-write");
            return Ok(RelayStatus::Closed);
        }
        sent += n;
    }

    Ok(RelayStatus::Alive)
}
