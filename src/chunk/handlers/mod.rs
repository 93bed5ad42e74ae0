//! Built-in chunk handlers
//!
//! Each handler module exposes:
//! - a `*Request` enum whose `encode()` builds the outbound chunk,
//! - a `*Event` enum whose `decode()` parses an inbound chunk,
//! - the handler that applies events to the session and its listeners,
//! - request helpers on [`ClientSession`](crate::client::ClientSession).

pub mod heap;
pub mod hello;
pub mod native_heap;
pub mod profiling;
pub mod view;

pub use heap::HeapHandler;
pub use hello::HelloHandler;
pub use native_heap::NativeHeapHandler;
pub use profiling::ProfilingHandler;
pub use view::ViewDebugHandler;

use super::types::ChunkType;
use crate::codec::ByteReader;
use crate::error::Result;

/// Failure reply to any request
pub const FAIL: ChunkType = ChunkType::from_tag(b"FAIL");

/// Decoded FAIL payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub error_code: i32,
    pub message: String,
}

impl Failure {
    /// `error_code i32, msg_len i32, UTF-16 message`
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(payload);
        let error_code = reader.i32()?;
        let message = reader.string()?;
        Ok(Self {
            error_code,
            message,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteWriter;

    #[test]
    fn test_failure_decode() {
        let mut writer = ByteWriter::new();
        writer.i32(-3).string("out of memory");
        let failure = Failure::decode(&writer.into_inner()).unwrap();
        assert_eq!(failure.error_code, -3);
        assert_eq!(failure.message, "out of memory");
    }
}
