//! Reassembly of 4-hex-length blocks from a non-blocking socket
//!
//! Readiness loops read whatever bytes are available; this buffer holds the
//! partial tail until a whole block has arrived.

use super::protocol::parse_hex_length;
use crate::error::Result;

/// Accumulates bytes and yields complete blocks
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes waiting for the rest of their block
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete block, or `None` until more bytes arrive
    ///
    /// A malformed length prefix is an error; the stream cannot be
    /// resynchronised after one.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = parse_hex_length(&self.buf[..4])?;
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let frame = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Ok(Some(frame))
    }
}
