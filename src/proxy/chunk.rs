//! Chunked-body remainder computation
//!
//! The relay never decodes chunked bodies; it only needs to know how many
//! more bytes belong to the response so it can forward frames verbatim and
//! detect the terminal chunk. [`ChunkFramer::remaining_in_chunk`] walks the
//! chunk structure already sitting in the buffer and answers exactly that.
//!
//! Chunk-size lines can straddle read boundaries, so the framer is allowed
//! to pull small, bounded extra reads from the source; whatever it appends
//! to the buffer is flushed downstream by the caller along with the rest.

use super::headers::find_crlf;
use super::{Error, Result, EXTRA_READ_BYTES};
use bytes::BytesMut;
use std::io::Read;
use tracing::warn;

/// Remainder calculator for chunked transfer encoding
///
/// Borrows the upstream source for the duration of one computation so it
/// can top up the buffer when a size line is cut off.
pub struct ChunkFramer<'a, R: Read> {
    source: &'a mut R,
}

impl<'a, R: Read> ChunkFramer<'a, R> {
    /// Create a framer reading extra bytes from `source`
    pub fn new(source: &'a mut R) -> Self {
        ChunkFramer { source }
    }

    /// Bytes still owed to the response body, counting from the chunk-size
    /// line expected at `offset`
    ///
    /// Walks consecutive chunks that are already fully buffered and stops
    /// at the first one that is not: the return value is how many of that
    /// chunk's data bytes have not been buffered yet. Zero is returned only
    /// once the terminal chunk has been seen.
    ///
    /// A size token cut off at the buffer end gets one extra read and one
    /// reparse; if it still is not terminated the response is rejected.
    pub fn remaining_in_chunk(&mut self, buf: &mut BytesMut, offset: usize) -> Result<usize> {
        let mut offset = offset;

        loop {
            while offset >= buf.len() {
                self.read_more(buf)?;
            }

            let (mut size, mut token_end) = parse_chunk_size(buf, offset);
            if token_end == buf.len() {
                self.read_more(buf)?;
                (size, token_end) = parse_chunk_size(buf, offset);
            }

            if size == 0 {
                if token_end == buf.len() {
                    warn!("terminal chunk missing trailing line break");
                }
                return Ok(0);
            }

            if token_end == buf.len() {
                return Err(Error::Protocol("chunk size token truncated".to_string()));
            }

            let line_end = loop {
                match find_crlf(&buf[token_end..]) {
                    Some(i) => break token_end + i,
                    None => self.read_more(buf)?,
                }
            };

            let data_start = line_end + 2;
            let available = buf.len() - data_start;
            if available < size {
                return Ok(size - available);
            }

            // This chunk is fully buffered; step past its data and the
            // trailing CRLF to the next size line
            offset = data_start + size + 2;
        }
    }

    /// Append one bounded read from the source to the buffer
    fn read_more(&mut self, buf: &mut BytesMut) -> Result<()> {
        let old_len = buf.len();
        buf.resize(old_len + EXTRA_READ_BYTES, 0);

        let n = self.source.read(&mut buf[old_len..])?;
        buf.truncate(old_len + n);

        if n == 0 {
            return Err(Error::ConnectionClosed);
        }

        Ok(())
    }
}

/// Parse the hex chunk size expected at `offset`
///
/// Mirrors `strtol` with base 16: leading whitespace is skipped, parsing
/// stops at the first non-hex byte. Returns the size and the index one
/// past the last digit; when there are no digits at all the size is zero
/// and the index is `offset` itself.
fn parse_chunk_size(buf: &[u8], offset: usize) -> (usize, usize) {
    let mut i = offset;
    while i < buf.len() && buf[i].is_ascii_whitespace() {
        i += 1;
    }

    let digits_start = i;
    let mut size: usize = 0;
    while i < buf.len() && buf[i].is_ascii_hexdigit() {
        let digit = (buf[i] as char).to_digit(16).unwrap_or(0) as usize;
        size = size.saturating_mul(16).saturating_add(digit);
        i += 1;
    }

    if i == digits_start {
        (0, offset)
    } else {
        (size, i)
    }
}
