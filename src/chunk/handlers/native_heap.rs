//! Native heap chunks: NHGT, NHSG, NHST, NHEN

use super::heap::{SegmentWhat, SegmentWhen};
use crate::chunk::packet::Chunk;
use crate::chunk::registry::ChunkHandler;
use crate::chunk::types::ChunkType;
use crate::client::ClientSession;
use crate::codec::{NativeHeapSnapshot, decode_native_heap};
use crate::core::listener::Listeners;
use crate::error::{Error, Result};

pub const NHGT: ChunkType = ChunkType::from_tag(b"NHGT");
pub const NHSG: ChunkType = ChunkType::from_tag(b"NHSG");
pub const NHST: ChunkType = ChunkType::from_tag(b"NHST");
pub const NHEN: ChunkType = ChunkType::from_tag(b"NHEN");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeHeapRequest {
    Snapshot,
    Segments { when: SegmentWhen, what: SegmentWhat },
}

impl NativeHeapRequest {
    pub fn encode(&self) -> Chunk {
        match self {
            NativeHeapRequest::Snapshot => Chunk::empty(NHGT),
            NativeHeapRequest::Segments { when, what } => {
                Chunk::new(NHSG, vec![*when as u8, *what as u8])
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeHeapEvent {
    Snapshot(NativeHeapSnapshot),
    SegmentsStart,
    SegmentData(Vec<u8>),
    SegmentsEnd,
}

impl NativeHeapEvent {
    pub fn decode(chunk: &Chunk) -> Result<Self> {
        match chunk.kind {
            NHGT => Ok(NativeHeapEvent::Snapshot(decode_native_heap(&chunk.payload)?)),
            NHST => Ok(NativeHeapEvent::SegmentsStart),
            NHSG => Ok(NativeHeapEvent::SegmentData(chunk.payload.clone())),
            NHEN => Ok(NativeHeapEvent::SegmentsEnd),
            other => Err(Error::UnknownChunk(other.name())),
        }
    }
}

pub struct NativeHeapHandler {
    listeners: Listeners,
}

impl NativeHeapHandler {
    pub fn new(listeners: Listeners) -> Self {
        Self { listeners }
    }
}

impl ChunkHandler for NativeHeapHandler {
    fn name(&self) -> &'static str {
        "native-heap"
    }

    fn chunk_types(&self) -> &'static [ChunkType] {
        &[NHGT, NHSG, NHST, NHEN]
    }

    fn handle_chunk(
        &self,
        client: &ClientSession,
        chunk: &Chunk,
        _is_reply: bool,
        _msg_id: u32,
    ) -> Result<()> {
        match NativeHeapEvent::decode(chunk)? {
            NativeHeapEvent::Snapshot(snapshot) => {
                log::debug!(
                    "{}: native heap {} bytes, {} allocations, {} maps",
                    client.key(),
                    snapshot.total_memory,
                    snapshot.allocations.len(),
                    snapshot.maps.len()
                );
                client.data().native_snapshot = Some(snapshot.clone());
                self.listeners.telemetry(|s| s.native_heap(client, &snapshot));
            }
            NativeHeapEvent::SegmentsStart => client.data().native_heap.clear(),
            NativeHeapEvent::SegmentData(raw) => client.data().native_heap.add(raw),
            NativeHeapEvent::SegmentsEnd => {
                let segments = {
                    let mut data = client.data();
                    data.native_heap.seal();
                    data.native_heap.segments()
                };
                self.listeners
                    .telemetry(|s| s.native_heap_segments(client, &segments));
            }
        }
        Ok(())
    }
}

impl ClientSession {
    /// Request a native heap snapshot and turn segment reporting off
    pub fn request_native_heap(&self) -> Result<u32> {
        let id = self.send_chunk(NativeHeapRequest::Snapshot.encode())?;
        self.send_chunk(
            NativeHeapRequest::Segments {
                when: SegmentWhen::Disable,
                what: SegmentWhat::Object,
            }
            .encode(),
        )?;
        Ok(id)
    }
}
