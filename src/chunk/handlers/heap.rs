//! VM heap, hprof and allocation tracking chunks

use super::{FAIL, Failure};
use crate::chunk::packet::Chunk;
use crate::chunk::registry::ChunkHandler;
use crate::chunk::types::ChunkType;
use crate::client::ClientSession;
use crate::codec::heap::decode_heap_info;
use crate::codec::{ByteReader, ByteWriter, HeapInfo, decode_allocations};
use crate::core::listener::Listeners;
use crate::core::types::AllocationTrackingStatus;
use crate::error::{Error, Result};

pub const HPIF: ChunkType = ChunkType::from_tag(b"HPIF");
pub const HPST: ChunkType = ChunkType::from_tag(b"HPST");
pub const HPEN: ChunkType = ChunkType::from_tag(b"HPEN");
pub const HPSG: ChunkType = ChunkType::from_tag(b"HPSG");
pub const HPGC: ChunkType = ChunkType::from_tag(b"HPGC");
pub const HPDU: ChunkType = ChunkType::from_tag(b"HPDU");
pub const HPDS: ChunkType = ChunkType::from_tag(b"HPDS");
pub const REAE: ChunkType = ChunkType::from_tag(b"REAE");
pub const REAQ: ChunkType = ChunkType::from_tag(b"REAQ");
pub const REAL: ChunkType = ChunkType::from_tag(b"REAL");

/// When the VM sends HPIF reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeapInfoWhen {
    Never = 0,
    Now = 1,
    NextGc = 2,
    EveryGc = 3,
}

/// When the VM sends heap segment reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentWhen {
    Disable = 0,
    Gc = 1,
}

/// Segment report granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentWhat {
    Merge = 0,
    Object = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapRequest {
    HeapInfo(HeapInfoWhen),
    Segments { when: SegmentWhen, what: SegmentWhat },
    Gc,
    DumpToFile(String),
    DumpStreaming,
    EnableAllocationTracking(bool),
    QueryAllocationTracking,
    FetchAllocations,
}

impl HeapRequest {
    pub fn encode(&self) -> Chunk {
        match self {
            HeapRequest::HeapInfo(when) => Chunk::new(HPIF, vec![*when as u8]),
            HeapRequest::Segments { when, what } => {
                Chunk::new(HPSG, vec![*when as u8, *what as u8])
            }
            HeapRequest::Gc => Chunk::empty(HPGC),
            HeapRequest::DumpToFile(path) => {
                let mut writer = ByteWriter::new();
                writer.string(path);
                Chunk::new(HPDU, writer.into_inner())
            }
            HeapRequest::DumpStreaming => Chunk::empty(HPDS),
            HeapRequest::EnableAllocationTracking(enable) => {
                Chunk::new(REAE, vec![u8::from(*enable)])
            }
            HeapRequest::QueryAllocationTracking => Chunk::empty(REAQ),
            HeapRequest::FetchAllocations => Chunk::empty(REAL),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapEvent {
    HeapInfo(Vec<HeapInfo>),
    SegmentsStart,
    SegmentData(Vec<u8>),
    SegmentsEnd,
    /// HPDU reply, 0 on success
    DumpResult(u8),
    DumpData(Vec<u8>),
    AllocationStatus(bool),
    /// Undecoded REAL payload
    Allocations(Vec<u8>),
    Failed(Failure),
}

impl HeapEvent {
    pub fn decode(chunk: &Chunk) -> Result<Self> {
        let mut reader = ByteReader::new(&chunk.payload);
        match chunk.kind {
            HPIF => Ok(HeapEvent::HeapInfo(decode_heap_info(&chunk.payload)?)),
            HPST => Ok(HeapEvent::SegmentsStart),
            HPSG => Ok(HeapEvent::SegmentData(chunk.payload.clone())),
            HPEN => Ok(HeapEvent::SegmentsEnd),
            HPDU => Ok(HeapEvent::DumpResult(reader.u8()?)),
            HPDS => Ok(HeapEvent::DumpData(chunk.payload.clone())),
            REAQ => Ok(HeapEvent::AllocationStatus(reader.u8()? != 0)),
            REAL => Ok(HeapEvent::Allocations(chunk.payload.clone())),
            FAIL => Ok(HeapEvent::Failed(Failure::decode(&chunk.payload)?)),
            other => Err(Error::UnknownChunk(other.name())),
        }
    }
}

/// Applies heap and allocation events
pub struct HeapHandler {
    listeners: Listeners,
}

impl HeapHandler {
    pub fn new(listeners: Listeners) -> Self {
        Self { listeners }
    }

    fn apply(&self, client: &ClientSession, event: HeapEvent) -> Result<()> {
        match event {
            HeapEvent::HeapInfo(heaps) => {
                {
                    let mut data = client.data();
                    for info in &heaps {
                        data.heap_info.insert(info.heap_id, *info);
                    }
                }
                for info in &heaps {
                    self.listeners.telemetry(|s| s.heap_info(client, info));
                }
            }
            HeapEvent::SegmentsStart => client.data().vm_heap.clear(),
            HeapEvent::SegmentData(raw) => client.data().vm_heap.add(raw),
            HeapEvent::SegmentsEnd => {
                let segments = {
                    let mut data = client.data();
                    data.vm_heap.seal();
                    data.vm_heap.segments()
                };
                log::debug!("{}: {} heap segments", client.key(), segments.len());
                self.listeners
                    .telemetry(|s| s.heap_segments(client, &segments));
            }
            HeapEvent::DumpResult(result) => {
                let path = client.data().pending_hprof_file.take();
                let Some(handler) = &self.listeners.hprof else {
                    return Ok(());
                };
                if result == 0 {
                    handler.on_success_file(path.as_deref().unwrap_or_default(), client);
                } else {
                    log::warn!("{}: hprof dump failed ({})", client.key(), result);
                    handler.on_end_failure(client, None);
                }
            }
            HeapEvent::DumpData(bytes) => {
                log::info!("{}: received {} bytes of hprof", client.key(), bytes.len());
                if let Some(handler) = &self.listeners.hprof {
                    handler.on_success_data(&bytes, client);
                }
            }
            HeapEvent::AllocationStatus(enabled) => {
                let status = if enabled {
                    AllocationTrackingStatus::On
                } else {
                    AllocationTrackingStatus::Off
                };
                client.data().allocation_status = status;
                self.listeners
                    .telemetry(|s| s.allocation_status(client, status));
            }
            HeapEvent::Allocations(raw) => {
                if let Some(handler) = &self.listeners.allocation_tracking {
                    handler.on_success(&raw, client);
                    return Ok(());
                }
                let records = decode_allocations(&raw)?;
                log::debug!("{}: {} allocation records", client.key(), records.len());
                client.data().allocations = records.clone();
                self.listeners.telemetry(|s| s.allocations(client, &records));
            }
            HeapEvent::Failed(failure) => {
                log::warn!(
                    "{}: heap request failed ({}): {}",
                    client.key(),
                    failure.error_code,
                    failure.message
                );
                let pending = client.data().pending_hprof_file.take();
                if pending.is_some()
                    && let Some(handler) = &self.listeners.hprof
                {
                    handler.on_end_failure(client, Some(&failure.message));
                }
            }
        }
        Ok(())
    }
}

impl ChunkHandler for HeapHandler {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn chunk_types(&self) -> &'static [ChunkType] {
        &[HPIF, HPST, HPEN, HPSG, HPGC, HPDU, HPDS, REAE, REAQ, REAL]
    }

    /// Ask for the tracking status so it is known before the first REAL
    fn client_ready(&self, client: &ClientSession) -> Result<()> {
        client.request_allocation_status()?;
        Ok(())
    }

    fn handle_chunk(
        &self,
        client: &ClientSession,
        chunk: &Chunk,
        _is_reply: bool,
        _msg_id: u32,
    ) -> Result<()> {
        let event = HeapEvent::decode(chunk)?;
        self.apply(client, event)
    }
}

impl ClientSession {
    pub fn update_heap_info(&self, when: HeapInfoWhen) -> Result<u32> {
        self.send_chunk(HeapRequest::HeapInfo(when).encode())
    }

    pub fn request_heap_segments(&self, when: SegmentWhen, what: SegmentWhat) -> Result<u32> {
        self.send_chunk(HeapRequest::Segments { when, what }.encode())
    }

    pub fn execute_gc(&self) -> Result<u32> {
        self.send_chunk(HeapRequest::Gc.encode())
    }

    /// Dump to `remote_path` on the device; the result arrives through the hprof handler
    pub fn dump_hprof(&self, remote_path: &str) -> Result<u32> {
        self.data().pending_hprof_file = Some(remote_path.to_string());
        self.send_chunk(HeapRequest::DumpToFile(remote_path.to_string()).encode())
    }

    pub fn dump_hprof_streaming(&self) -> Result<u32> {
        self.send_chunk(HeapRequest::DumpStreaming.encode())
    }

    /// Toggle tracking, then query the new status
    pub fn enable_allocation_tracking(&self, enable: bool) -> Result<u32> {
        self.send_chunk(HeapRequest::EnableAllocationTracking(enable).encode())?;
        self.request_allocation_status()
    }

    pub fn request_allocation_status(&self) -> Result<u32> {
        self.send_chunk(HeapRequest::QueryAllocationTracking.encode())
    }

    pub fn request_allocation_details(&self) -> Result<u32> {
        self.send_chunk(HeapRequest::FetchAllocations.encode())
    }
}
