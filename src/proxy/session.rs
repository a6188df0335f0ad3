//! Per-connection relay state machine
//!
//! A session owns one client socket and at most one upstream socket, and
//! drives the whole exchange synchronously: accumulate the request head,
//! rewrite it for the origin, stream the request body, then relay the
//! response under whichever framing applies. Both sockets survive into the
//! next request when the exchange ends in keep-alive on both sides and the
//! target host is unchanged.
//!
//! An exchange over a previously used upstream socket gets one retry on a
//! fresh connection, which covers origins that silently dropped an idle
//! connection between requests.

use super::headers::find_crlf;
use super::{
    send_all, ChunkFramer, Error, HeaderBlock, Host, RelayStatus, Result, Side, TunnelRelay,
    UpstreamResolver, CONNECT_ESTABLISHED, DEFAULT_HTTP_PORT, DEFAULT_TLS_PORT,
};
use crate::net;
use crate::stats::ProxyStats;
use bytes::BytesMut;
use std::io::Read;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How much of the response body is still owed, and under which rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseFraming {
    /// Byte-counted body: declared content length or a body-less status
    Length { rest: u64 },
    /// Chunked body; `rest` counts data bytes of the current chunk
    Chunked { rest: u64 },
    /// No framing information; the body runs until the origin closes
    UntilClose,
}

/// One client connection's relay state
pub struct RelaySession {
    client: TcpStream,
    upstream: Option<TcpStream>,
    host: Option<Host>,
    headers: Option<HeaderBlock>,
    head_buf: BytesMut,
    resolver: UpstreamResolver,
    stats: Arc<ProxyStats>,
    peer: SocketAddr,
}

impl RelaySession {
    /// Create a session for an accepted client connection
    pub fn new(
        client: TcpStream,
        resolver: UpstreamResolver,
        stats: Arc<ProxyStats>,
        peer: SocketAddr,
    ) -> Self {
        RelaySession {
            client,
            upstream: None,
            host: None,
            headers: None,
            head_buf: BytesMut::new(),
            resolver,
            stats,
            peer,
        }
    }

    /// Serve requests until the client or the relay policy ends the session
    ///
    /// `Ok` covers every orderly end: client close, a non-keep-alive
    /// exchange, or a finished tunnel. Errors are transport or protocol
    /// failures the caller should log.
    pub fn run(&mut self) -> Result<()> {
        let size = net::read_buffer_size(&self.client)?;
        let mut buf = vec![0u8; size];

        loop {
            let n = self.client.read(&mut buf)?;
            if n == 0 {
                debug!(peer = %self.peer, "connection closed by client");
                return Ok(());
            }

            self.stats.add_bytes_in(n as u64);
            self.head_buf.extend_from_slice(&buf[..n]);

            let Some(parsed) = HeaderBlock::parse(&self.head_buf, Side::Request) else {
                continue;
            };

            if let Some(end) = find_crlf(&self.head_buf) {
                let line = String::from_utf8_lossy(&self.head_buf[..end]);
                info!(peer = %self.peer, request = %line, "request");
            }
            self.stats.add_request();

            let last_host = self.host.take();

            if self.head_buf.starts_with(b"CONNECT ") {
                self.host = Some(connect_target(&self.head_buf));
                return self.relay_tunnel();
            }

            let target = Host::split(parsed.field("Host").unwrap_or(""), DEFAULT_HTTP_PORT);
            self.host = Some(target);
            self.headers = Some(parsed);

            if last_host != self.host && self.upstream.is_some() {
                self.close_upstream();
            }

            match self.relay_exchange()? {
                RelayStatus::Alive => {
                    // Host and upstream stay for the next request
                    self.head_buf.clear();
                    self.headers = None;
                }
                RelayStatus::Closed => return Ok(()),
            }
        }
    }

    /// Run one request/response exchange, retrying once on a reused socket
    fn relay_exchange(&mut self) -> Result<RelayStatus> {
        if self.upstream.is_some() {
            return match self.exchange() {
                Ok(status) => {
                    info!(peer = %self.peer, "reused upstream connection");
                    Ok(status)
                }
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "reused connection failed, reconnecting");
                    self.exchange()
                }
            };
        }

        self.exchange()
    }

    /// One exchange attempt over the current or a fresh upstream socket
    fn exchange(&mut self) -> Result<RelayStatus> {
        let mut upstream = match self.upstream.take() {
            Some(stream) => stream,
            None => {
                let host = match self.host.as_ref() {
                    Some(host) => host,
                    None => return Err(Error::Protocol("no target host".to_string())),
                };
                self.resolver.connect(host)?
            }
        };

        match self.run_exchange(&mut upstream) {
            Ok(RelayStatus::Alive) => {
                self.upstream = Some(upstream);
                Ok(RelayStatus::Alive)
            }
            Ok(RelayStatus::Closed) => {
                let _ = upstream.shutdown(Shutdown::Both);
                Ok(RelayStatus::Closed)
            }
            Err(e) => {
                let _ = upstream.shutdown(Shutdown::Both);
                Err(e)
            }
        }
    }

    fn run_exchange(&mut self, upstream: &mut TcpStream) -> Result<RelayStatus> {
        self.forward_request_head(upstream)?;

        let body_offset = match self.headers.as_ref() {
            Some(head) => head.body_offset(),
            None => return Err(Error::Protocol("request head missing".to_string())),
        };
        // Body bytes that arrived together with the head
        if let RelayStatus::Closed = send_all(upstream, &self.head_buf[body_offset..])? {
            return Ok(RelayStatus::Closed);
        }

        self.relay_request_body(upstream)?;
        self.relay_response(upstream)
    }

    /// Rewrite and forward the request head
    ///
    /// The absolute-form target is cut back to its path and
    /// `Proxy-Connection` becomes `Connection` before the head goes out.
    fn forward_request_head(&mut self, upstream: &mut TcpStream) -> Result<()> {
        let Some(headers) = self.headers.as_mut() else {
            return Err(Error::Protocol("request head missing".to_string()));
        };

        let line_end = match find_crlf(&self.head_buf) {
            Some(i) => i,
            None => return Err(Error::Protocol("request line missing".to_string())),
        };
        let first_line = String::from_utf8_lossy(&self.head_buf[..line_end]);
        let first_line = rewrite_request_line(&first_line, headers.field("Host").unwrap_or(""));

        headers.promote_proxy_connection();
        let head = headers.serialize_head(&first_line);

        match send_all(upstream, &head)? {
            RelayStatus::Alive => Ok(()),
            RelayStatus::Closed => Err(Error::ConnectionClosed),
        }
    }

    /// Stream the rest of a content-length request body to the origin
    fn relay_request_body(&mut self, upstream: &mut TcpStream) -> Result<()> {
        let Some(headers) = self.headers.as_ref() else {
            return Err(Error::Protocol("request head missing".to_string()));
        };
        let Some(length) = headers.content_length() else {
            return Ok(());
        };

        let mut rest = body_remainder(headers.body_offset(), length, self.head_buf.len());
        if rest == 0 {
            return Ok(());
        }
        if rest < 0 {
            warn!(peer = %self.peer, "invalid content-length in request, treating body as complete");
            return Ok(());
        }

        let size = net::read_buffer_size(&self.client)?;
        let mut buf = vec![0u8; size];

        while rest > 0 {
            let want = (size as i64).min(rest) as usize;
            let n = self.client.read(&mut buf[..want])?;
            if n == 0 {
                // The response is still relayed; the origin decides what a
                // truncated body means
                warn!(peer = %self.peer, "client dropped connection mid-body");
                return Ok(());
            }

            self.stats.add_bytes_in(n as u64);
            if let RelayStatus::Closed = send_all(upstream, &buf[..n])? {
                return Err(Error::ConnectionClosed);
            }

            rest -= n as i64;
        }

        Ok(())
    }

    /// Relay the response to the client under its framing rules
    ///
    /// Header bytes accumulate until the head parses and are then flushed
    /// in one write; every later frame is forwarded after the framing
    /// bookkeeping has seen it.
    fn relay_response(&mut self, upstream: &mut TcpStream) -> Result<RelayStatus> {
        let request_keep_alive = self.headers.as_ref().map_or(true, |h| h.keep_alive());

        let mut response: Option<HeaderBlock> = None;
        let mut framing = ResponseFraming::UntilClose;
        let mut pending = BytesMut::new();

        loop {
            let size = net::read_buffer_size(upstream)?;
            let mut buf = BytesMut::zeroed(size);

            let n = match upstream.read(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "upstream read failed");
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }
            buf.truncate(n);

            if response.is_none() {
                pending.extend_from_slice(&buf);
                let Some(parsed) = HeaderBlock::parse(&pending, Side::Response) else {
                    continue;
                };
                framing = response_framing(&parsed, &mut pending, upstream, self.peer)?;
                response = Some(parsed);
            } else {
                framing = advance_framing(framing, n, &mut buf, upstream, self.peer)?;
            }

            let out = if pending.is_empty() { &buf } else { &pending };
            match send_all(&mut self.client, out)? {
                RelayStatus::Alive => self.stats.add_bytes_out(out.len() as u64),
                RelayStatus::Closed => return Err(Error::ConnectionClosed),
            }
            pending.clear();

            match framing {
                ResponseFraming::Length { rest: 0 } | ResponseFraming::Chunked { rest: 0 } => {
                    let response_keep_alive =
                        response.as_ref().map_or(true, |h| h.keep_alive());
                    if request_keep_alive && response_keep_alive {
                        return Ok(RelayStatus::Alive);
                    }
                    break;
                }
                ResponseFraming::UntilClose => {
                    // An unframed head below 200 (or one whose status line
                    // never parsed) leaves the connection to the next
                    // exchange
                    let status = response.as_ref().map_or(0, |h| h.status_code());
                    if status < 200 {
                        return Ok(RelayStatus::Alive);
                    }
                }
                _ => {}
            }
        }

        debug!(peer = %self.peer, "connection closed by server");
        Ok(RelayStatus::Closed)
    }

    /// Tunnel a `CONNECT` request
    ///
    /// Any previous upstream is torn down first; the tunnel target gets a
    /// dedicated connection and the session ends with the tunnel.
    fn relay_tunnel(&mut self) -> Result<()> {
        self.close_upstream();

        let host = match self.host.as_ref() {
            Some(host) => host.clone(),
            None => return Err(Error::Protocol("connect target missing".to_string())),
        };
        let mut upstream = self.resolver.connect(&host)?;

        match send_all(&mut self.client, CONNECT_ESTABLISHED)? {
            RelayStatus::Alive => self.stats.add_bytes_out(CONNECT_ESTABLISHED.len() as u64),
            RelayStatus::Closed => return Err(Error::ConnectionClosed),
        }

        TunnelRelay::new(&mut self.client, &mut upstream, &self.stats).run()
    }

    fn close_upstream(&mut self) {
        if let Some(stream) = self.upstream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Decide the response framing right after the head has parsed
fn response_framing(
    head: &HeaderBlock,
    pending: &mut BytesMut,
    upstream: &mut TcpStream,
    peer: SocketAddr,
) -> Result<ResponseFraming> {
    if let Some(length) = head.content_length() {
        let rest = body_remainder(head.body_offset(), length, pending.len());
        if rest < 0 {
            warn!(%peer, "invalid content-length in response");
            return Ok(ResponseFraming::Length { rest: 0 });
        }
        return Ok(ResponseFraming::Length { rest: rest as u64 });
    }

    if head.finished_by_status_code() {
        return Ok(ResponseFraming::Length { rest: 0 });
    }

    if head.is_chunked() {
        let rest = ChunkFramer::new(upstream).remaining_in_chunk(pending, head.body_offset())?;
        return Ok(ResponseFraming::Chunked { rest: rest as u64 });
    }

    Ok(ResponseFraming::UntilClose)
}

/// Account one post-head frame against the current framing
fn advance_framing(
    framing: ResponseFraming,
    n: usize,
    buf: &mut BytesMut,
    upstream: &mut TcpStream,
    peer: SocketAddr,
) -> Result<ResponseFraming> {
    let n = n as u64;

    match framing {
        // The current chunk ends inside (or exactly at) this frame; the
        // next chunk-size line sits past its data and CRLF
        ResponseFraming::Chunked { rest } if rest <= n => {
            let next = ChunkFramer::new(upstream).remaining_in_chunk(buf, rest as usize + 2)?;
            Ok(ResponseFraming::Chunked { rest: next as u64 })
        }
        ResponseFraming::Chunked { rest } => Ok(ResponseFraming::Chunked { rest: rest - n }),
        ResponseFraming::Length { rest } if rest < n => {
            warn!(%peer, "junk data after response body");
            Ok(ResponseFraming::Length { rest: 0 })
        }
        ResponseFraming::Length { rest } => Ok(ResponseFraming::Length { rest: rest - n }),
        ResponseFraming::UntilClose => Ok(ResponseFraming::UntilClose),
    }
}

/// Bytes of a declared body still owed beyond what is already buffered
///
/// Saturating arithmetic keeps absurd declared lengths inside the i64
/// range; a negative result means the buffer already holds more than the
/// declared total.
fn body_remainder(body_offset: usize, length: i64, buffered: usize) -> i64 {
    (body_offset as i64)
        .saturating_add(length)
        .saturating_sub(buffered as i64)
}

/// Cut an absolute-form request target back to relative form
fn rewrite_request_line(first_line: &str, host_value: &str) -> String {
    let needle = format!(" http://{}", host_value);

    match first_line.find(&needle) {
        Some(pos) => {
            let mut line = first_line.to_string();
            line.replace_range(pos..pos + needle.len(), " ");
            line
        }
        None => first_line.to_string(),
    }
}

/// Extract the tunnel target from a CONNECT request line
fn connect_target(head: &[u8]) -> Host {
    let rest = head.get(8..).unwrap_or(b"");
    let end = rest
        .iter()
        .position(|&b| b == b' ' || b == b'\r')
        .unwrap_or(rest.len());

    Host::split(&String::from_utf8_lossy(&rest[..end]), DEFAULT_TLS_PORT)
}
