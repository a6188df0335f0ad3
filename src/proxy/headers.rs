//! Header block parsing and framing decisions
//!
//! [`HeaderBlock::parse`] is incremental: it returns `None` until the
//! buffer contains the full head (terminated by a blank line), and the
//! caller keeps reading and retrying. A parsed block answers the framing
//! questions the relay needs: keep-alive, content length, chunked transfer,
//! and body-less status codes.
//!
//! Field names are stored exactly as received; lookups compare names
//! case-insensitively. When the same name arrives twice with identical
//! spelling, the last occurrence wins.

use super::CRLF;
use std::collections::BTreeMap;
use std::fmt;

/// Which side of the exchange a header block was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Request,
    Response,
}

/// Parsed view of an HTTP/1.x message head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBlock {
    status_code: u16,
    fields: BTreeMap<String, String>,
    body_offset: usize,
}

impl HeaderBlock {
    /// Parse a message head out of `buf`
    ///
    /// Returns `None` while the blank-line terminator has not arrived yet;
    /// the caller should read more and retry. Never fails: malformed field
    /// lines are skipped rather than rejected.
    ///
    /// Field lines prefer a `": "` separator and fall back to a bare `:`.
    /// Either way the value starts two bytes past the separator, and lines
    /// whose value would be empty are dropped.
    pub fn parse(buf: &[u8], side: Side) -> Option<HeaderBlock> {
        let terminator = find_blank_line(buf)?;
        let body_offset = terminator + 4;

        let mut status_code = 0;
        if side == Side::Response && buf.starts_with(b"HTTP/") {
            // Status digits sit right after the fixed-width "HTTP/x.y "
            if let Some(rest) = buf.get(9..) {
                status_code = atoi(rest).clamp(0, u16::MAX as i64) as u16;
            }
        }

        let mut fields = BTreeMap::new();
        let first_line_end = find_crlf(buf)?;
        let mut pos = first_line_end + 2;

        while pos < buf.len() && buf[pos] != b'\r' {
            let line_end = match find_crlf(&buf[pos..]) {
                Some(i) => pos + i,
                None => break,
            };

            let separator = match buf[pos..].windows(2).position(|w| w == b": ") {
                Some(i) if pos + i < line_end => Some(pos + i),
                _ => buf[pos..].iter().position(|&b| b == b':').map(|i| pos + i),
            };

            if let Some(colon) = separator {
                if colon + 2 < line_end {
                    let name = String::from_utf8_lossy(&buf[pos..colon]).into_owned();
                    let value = String::from_utf8_lossy(&buf[colon + 2..line_end]).into_owned();
                    fields.insert(name, value);
                }
            }

            pos = line_end + 2;
        }

        Some(HeaderBlock {
            status_code,
            fields,
            body_offset,
        })
    }

    /// Response status code; zero for requests and unparsable status lines
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Index of the first body byte in the buffer this head was parsed from
    pub fn body_offset(&self) -> usize {
        self.body_offset
    }

    /// Look up a field value by name, case-insensitively
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a field exists, case-insensitively
    pub fn contains(&self, name: &str) -> bool {
        self.fields.keys().any(|k| k.eq_ignore_ascii_case(name))
    }

    /// Whether the connection stays open after this message
    ///
    /// Only an explicit `Connection: close` turns keep-alive off; a message
    /// with no `Connection` field keeps the connection open regardless of
    /// HTTP version.
    pub fn keep_alive(&self) -> bool {
        match self.field("Connection") {
            Some(value) => !value.eq_ignore_ascii_case("close"),
            None => true,
        }
    }

    /// Whether the status code alone says the response carries no body
    ///
    /// True for 1xx and 304 responses.
    pub fn finished_by_status_code(&self) -> bool {
        self.status_code != 0 && (self.status_code < 200 || self.status_code == 304)
    }

    /// Whether the body uses chunked transfer encoding
    pub fn is_chunked(&self) -> bool {
        self.field("Transfer-Encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    }

    /// Declared content length, if the field is present
    ///
    /// The value is read like C's `atoi`: leading integer, garbage yields
    /// zero, a sign is honored. Negative lengths are the caller's problem.
    pub fn content_length(&self) -> Option<i64> {
        self.field("Content-Length").map(|v| atoi(v.as_bytes()))
    }

    /// Rename `Proxy-Connection` to `Connection`
    ///
    /// The field is always removed; its value moves under `Connection` only
    /// when no `Connection` field already exists.
    pub fn promote_proxy_connection(&mut self) {
        let keys: Vec<String> = self
            .fields
            .keys()
            .filter(|k| k.eq_ignore_ascii_case("Proxy-Connection"))
            .cloned()
            .collect();

        let mut value = None;
        for key in keys {
            value = self.fields.remove(&key);
        }

        if let Some(value) = value {
            if !self.contains("Connection") {
                self.fields.insert("Connection".to_string(), value);
            }
        }
    }

    /// Serialize the head with a replacement first line
    ///
    /// Fields are written in stored (sorted) order, blank-line terminated.
    pub fn serialize_head(&self, first_line: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(first_line.len() + 32 * (self.fields.len() + 1));

        out.extend_from_slice(first_line.as_bytes());
        out.extend_from_slice(CRLF.as_bytes());
        for (name, value) in &self.fields {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(CRLF.as_bytes());
        }
        out.extend_from_slice(CRLF.as_bytes());

        out
    }
}

/// Target host for an upstream connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub name: String,
    pub port: u16,
}

impl Host {
    /// Split a `host[:port]` declaration
    ///
    /// Splits at the first colon; `default_port` applies when there is
    /// none. The port is read like C's `atoi`, so parsing stops at the
    /// first non-digit and a digit-free port becomes zero, which later
    /// fails resolution rather than being guessed at.
    pub fn split(decl: &str, default_port: u16) -> Host {
        match decl.split_once(':') {
            Some((name, port)) => Host {
                name: name.to_string(),
                port: atoi(port.as_bytes()).clamp(0, u16::MAX as i64) as u16,
            },
            None => Host {
                name: decl.to_string(),
                port: default_port,
            },
        }
    }

    /// Key under which this host's resolved address is cached
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.name, self.port)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

/// Find the next CRLF in a buffer
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Find the blank-line terminator of a message head
fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse a leading decimal integer the way C's `atoi` does
///
/// Skips leading whitespace, honors one sign character, stops at the first
/// non-digit. No digits means zero. Out-of-range values saturate.
pub(crate) fn atoi(bytes: &[u8]) -> i64 {
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }

    let mut negative = false;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        negative = bytes[i] == b'-';
        i += 1;
    }

    let mut value: i64 = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        value = value
            .saturating_mul(10)
            .saturating_add((bytes[i] - b'0') as i64);
        i += 1;
    }

    if negative {
        -value
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_incomplete_returns_none() {
        assert!(HeaderBlock::parse(b"", Side::Request).is_none());
        assert!(HeaderBlock::parse(b"GET / HTTP/1.1\r\n", Side::Request).is_none());
        assert!(
            HeaderBlock::parse(b"GET / HTTP/1.1\r\nHost: example.com\r\n", Side::Request)
                .is_none()
        );
    }

    #[test]
    fn test_parse_body_offset() {
        let buf = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\nBODY";
        let head = HeaderBlock::parse(buf, Side::Request).unwrap();

        assert_eq!(head.body_offset(), buf.len() - 4);
        assert_eq!(&buf[head.body_offset()..], b"BODY");
        assert_eq!(head.field("Host"), Some("example.com"));
    }

    #[test]
    fn test_parse_request_has_no_status() {
        let head = HeaderBlock::parse(b"GET / HTTP/1.1\r\n\r\n", Side::Request).unwrap();
        assert_eq!(head.status_code(), 0);
    }

    #[test]
    fn test_parse_response_status() {
        let head =
            HeaderBlock::parse(b"HTTP/1.1 404 Not Found\r\nServer: x\r\n\r\n", Side::Response)
                .unwrap();
        assert_eq!(head.status_code(), 404);

        // A response that does not start with HTTP/ has no status
        let head = HeaderBlock::parse(b"ICY 200 OK\r\n\r\n", Side::Response).unwrap();
        assert_eq!(head.status_code(), 0);

        // Truncated status line parses with status zero
        let head = HeaderBlock::parse(b"HTTP/1.1\r\n\r\n", Side::Response).unwrap();
        assert_eq!(head.status_code(), 0);
    }

    #[test]
    fn test_field_lookup_is_case_insensitive() {
        let head = HeaderBlock::parse(
            b"GET / HTTP/1.1\r\nContent-Type: text/html\r\n\r\n",
            Side::Request,
        )
        .unwrap();

        assert_eq!(head.field("content-type"), Some("text/html"));
        assert_eq!(head.field("CONTENT-TYPE"), Some("text/html"));
        assert!(head.contains("content-TYPE"));
        assert!(!head.contains("Content-Length"));
    }

    #[test]
    fn test_duplicate_field_last_wins() {
        let head = HeaderBlock::parse(
            b"GET / HTTP/1.1\r\nX-Tag: first\r\nX-Tag: second\r\n\r\n",
            Side::Request,
        )
        .unwrap();

        assert_eq!(head.field("X-Tag"), Some("second"));
    }

    #[test]
    fn test_bare_colon_separator() {
        // Without the separator space, the value still starts two bytes
        // past the colon, so its first byte is lost
        let head =
            HeaderBlock::parse(b"GET / HTTP/1.1\r\nHost:example.com\r\n\r\n", Side::Request)
                .unwrap();
        assert_eq!(head.field("Host"), Some("xample.com"));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let head = HeaderBlock::parse(
            b"GET / HTTP/1.1\r\nno separator here\r\nEmpty:\r\nGood: yes\r\n\r\n",
            Side::Request,
        )
        .unwrap();

        assert!(!head.contains("no separator here"));
        assert!(!head.contains("Empty"));
        assert_eq!(head.field("Good"), Some("yes"));
    }

    #[test]
    fn test_keep_alive() {
        let close =
            HeaderBlock::parse(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n", Side::Response)
                .unwrap();
        assert!(!close.keep_alive());

        let close_mixed_case =
            HeaderBlock::parse(b"HTTP/1.1 200 OK\r\nconnection: Close\r\n\r\n", Side::Response)
                .unwrap();
        assert!(!close_mixed_case.keep_alive());

        let keep = HeaderBlock::parse(
            b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\n\r\n",
            Side::Response,
        )
        .unwrap();
        assert!(keep.keep_alive());

        // No Connection field defaults to keep-alive, HTTP/1.0 included
        let absent = HeaderBlock::parse(b"HTTP/1.0 200 OK\r\n\r\n", Side::Response).unwrap();
        assert!(absent.keep_alive());
    }

    #[test]
    fn test_finished_by_status_code() {
        let status = |code: &[u8]| {
            let mut buf = b"HTTP/1.1 ".to_vec();
            buf.extend_from_slice(code);
            buf.extend_from_slice(b" X\r\n\r\n");
            HeaderBlock::parse(&buf, Side::Response).unwrap()
        };

        assert!(status(b"100").finished_by_status_code());
        assert!(status(b"101").finished_by_status_code());
        assert!(status(b"304").finished_by_status_code());
        assert!(!status(b"200").finished_by_status_code());
        assert!(!status(b"404").finished_by_status_code());

        // Status zero (request or junk status line) never finishes by code
        let request = HeaderBlock::parse(b"GET / HTTP/1.1\r\n\r\n", Side::Request).unwrap();
        assert!(!request.finished_by_status_code());
    }

    #[test]
    fn test_is_chunked() {
        let chunked = HeaderBlock::parse(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: Chunked\r\n\r\n",
            Side::Response,
        )
        .unwrap();
        assert!(chunked.is_chunked());

        let plain =
            HeaderBlock::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n", Side::Response)
                .unwrap();
        assert!(!plain.is_chunked());
    }

    #[test]
    fn test_content_length() {
        let parse_cl = |v: &str| {
            let buf = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", v);
            HeaderBlock::parse(buf.as_bytes(), Side::Response)
                .unwrap()
                .content_length()
        };

        assert_eq!(parse_cl("123"), Some(123));
        assert_eq!(parse_cl("-5"), Some(-5));
        assert_eq!(parse_cl("12abc"), Some(12));
        assert_eq!(parse_cl("abc"), Some(0));

        let absent = HeaderBlock::parse(b"HTTP/1.1 200 OK\r\n\r\n", Side::Response).unwrap();
        assert_eq!(absent.content_length(), None);
    }

    #[test]
    fn test_promote_proxy_connection() {
        let mut head = HeaderBlock::parse(
            b"GET / HTTP/1.1\r\nProxy-Connection: keep-alive\r\n\r\n",
            Side::Request,
        )
        .unwrap();
        head.promote_proxy_connection();

        assert!(!head.contains("Proxy-Connection"));
        assert_eq!(head.field("Connection"), Some("keep-alive"));
    }

    #[test]
    fn test_promote_does_not_overwrite_connection() {
        let mut head = HeaderBlock::parse(
            b"GET / HTTP/1.1\r\nConnection: close\r\nProxy-Connection: keep-alive\r\n\r\n",
            Side::Request,
        )
        .unwrap();
        head.promote_proxy_connection();

        assert!(!head.contains("Proxy-Connection"));
        assert_eq!(head.field("Connection"), Some("close"));
    }

    #[test]
    fn test_serialize_head_sorted_fields() {
        let mut head = HeaderBlock::parse(
            b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n",
            Side::Request,
        )
        .unwrap();
        head.promote_proxy_connection();

        let out = head.serialize_head("GET / HTTP/1.1");
        assert_eq!(
            out,
            b"GET / HTTP/1.1\r\nAccept: */*\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn test_host_split() {
        let host = Host::split("example.com:8080", 80);
        assert_eq!(host.name, "example.com");
        assert_eq!(host.port, 8080);

        let host = Host::split("example.com", 80);
        assert_eq!(host.port, 80);

        // Bytes after the digits are ignored, as a sloppy field value
        // with trailing whitespace would have them
        let host = Host::split("example.com:8080 ", 80);
        assert_eq!(host.port, 8080);

        // A port with no digits at all yields zero, not the default
        let host = Host::split("example.com:abc", 80);
        assert_eq!(host.port, 0);

        // Out-of-range ports clamp instead of wrapping
        let host = Host::split("example.com:99999", 80);
        assert_eq!(host.port, u16::MAX);

        assert_eq!(Host::split("a.example:443", 80).cache_key(), "a.example:443");
    }

    #[test]
    fn test_atoi() {
        assert_eq!(atoi(b"123"), 123);
        assert_eq!(atoi(b"  42 tail"), 42);
        assert_eq!(atoi(b"-17"), -17);
        assert_eq!(atoi(b"+8"), 8);
        assert_eq!(atoi(b"junk"), 0);
        assert_eq!(atoi(b""), 0);
        assert_eq!(atoi(b"99999999999999999999999"), i64::MAX);
    }
}
