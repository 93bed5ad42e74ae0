//! Method tracing and sampling profiler chunks

use super::{FAIL, Failure};
use crate::chunk::packet::Chunk;
use crate::chunk::registry::ChunkHandler;
use crate::chunk::types::ChunkType;
use crate::client::ClientSession;
use crate::codec::{ByteReader, ByteWriter};
use crate::core::listener::Listeners;
use crate::core::types::MethodProfilingStatus;
use crate::error::{Error, Result};

pub const MPRS: ChunkType = ChunkType::from_tag(b"MPRS");
pub const MPRE: ChunkType = ChunkType::from_tag(b"MPRE");
pub const MPSS: ChunkType = ChunkType::from_tag(b"MPSS");
pub const MPSE: ChunkType = ChunkType::from_tag(b"MPSE");
pub const SPSS: ChunkType = ChunkType::from_tag(b"SPSS");
pub const SPSE: ChunkType = ChunkType::from_tag(b"SPSE");
pub const MPRQ: ChunkType = ChunkType::from_tag(b"MPRQ");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfilingRequest {
    /// Trace into a file on the device
    StartFile {
        path: String,
        buffer_size: i32,
        flags: i32,
    },
    StopFile,
    StartStreaming {
        buffer_size: i32,
        flags: i32,
    },
    StopStreaming,
    StartSampling {
        buffer_size: i32,
        interval_us: i32,
    },
    StopSampling,
    QueryStatus,
}

impl ProfilingRequest {
    pub fn encode(&self) -> Chunk {
        let mut writer = ByteWriter::new();
        let kind = match self {
            ProfilingRequest::StartFile {
                path,
                buffer_size,
                flags,
            } => {
                writer.i32(*buffer_size).i32(*flags).string(path);
                MPRS
            }
            ProfilingRequest::StopFile => MPRE,
            ProfilingRequest::StartStreaming { buffer_size, flags } => {
                writer.i32(*buffer_size).i32(*flags);
                MPSS
            }
            ProfilingRequest::StopStreaming => MPSE,
            ProfilingRequest::StartSampling {
                buffer_size,
                interval_us,
            } => {
                writer.i32(*buffer_size).i32(0).i32(*interval_us);
                SPSS
            }
            ProfilingRequest::StopSampling => SPSE,
            ProfilingRequest::QueryStatus => MPRQ,
        };
        Chunk::new(kind, writer.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfilingEvent {
    /// MPRE reply, 0 on success
    FileTraceResult(u8),
    /// MPSE or SPSE reply payload
    TraceData(Vec<u8>),
    Status(MethodProfilingStatus),
    Failed(Failure),
}

impl ProfilingEvent {
    pub fn decode(chunk: &Chunk) -> Result<Self> {
        let mut reader = ByteReader::new(&chunk.payload);
        match chunk.kind {
            MPRE => Ok(ProfilingEvent::FileTraceResult(reader.u8()?)),
            MPSE | SPSE => Ok(ProfilingEvent::TraceData(chunk.payload.clone())),
            MPRQ => Ok(ProfilingEvent::Status(MethodProfilingStatus::from_wire(
                reader.u8()?,
            ))),
            FAIL => Ok(ProfilingEvent::Failed(Failure::decode(&chunk.payload)?)),
            other => Err(Error::UnknownChunk(other.name())),
        }
    }
}

pub struct ProfilingHandler {
    listeners: Listeners,
}

impl ProfilingHandler {
    pub fn new(listeners: Listeners) -> Self {
        Self { listeners }
    }

    fn set_status(&self, client: &ClientSession, status: MethodProfilingStatus) {
        client.data().method_profiling_status = status;
        self.listeners
            .telemetry(|s| s.method_profiling_status(client, status));
    }

    fn apply(&self, client: &ClientSession, event: ProfilingEvent) {
        let handler = self.listeners.method_profiling.as_ref();
        match event {
            ProfilingEvent::FileTraceResult(result) => {
                let path = client.data().pending_method_profiling_file.take();
                if let Some(handler) = handler {
                    if result == 0 {
                        handler.on_success_file(path.as_deref().unwrap_or_default(), client);
                    } else {
                        handler.on_end_failure(client, None);
                    }
                }
                self.set_status(client, MethodProfilingStatus::Off);
            }
            ProfilingEvent::TraceData(bytes) => {
                log::info!("{}: received {} bytes of trace", client.key(), bytes.len());
                if let Some(handler) = handler {
                    handler.on_success_data(&bytes, client);
                }
                self.set_status(client, MethodProfilingStatus::Off);
            }
            ProfilingEvent::Status(status) => self.set_status(client, status),
            ProfilingEvent::Failed(failure) => {
                log::warn!(
                    "{}: profiling failed ({}): {}",
                    client.key(),
                    failure.error_code,
                    failure.message
                );
                let pending = client.data().pending_method_profiling_file.take();
                if let Some(handler) = handler {
                    if pending.is_some() {
                        handler.on_start_failure(client, Some(&failure.message));
                    } else {
                        handler.on_end_failure(client, Some(&failure.message));
                    }
                }
                if let Err(e) = client.request_method_profiling_status() {
                    log::debug!("{}: status query not sent: {}", client.key(), e);
                }
            }
        }
    }
}

impl ChunkHandler for ProfilingHandler {
    fn name(&self) -> &'static str {
        "profiling"
    }

    fn chunk_types(&self) -> &'static [ChunkType] {
        &[MPRS, MPRE, MPSS, MPSE, SPSS, SPSE, MPRQ, FAIL]
    }

    fn client_ready(&self, client: &ClientSession) -> Result<()> {
        client.request_method_profiling_status()?;
        Ok(())
    }

    fn handle_chunk(
        &self,
        client: &ClientSession,
        chunk: &Chunk,
        _is_reply: bool,
        _msg_id: u32,
    ) -> Result<()> {
        let event = ProfilingEvent::decode(chunk)?;
        self.apply(client, event);
        Ok(())
    }
}

impl ClientSession {
    /// Start tracing into `remote_path`; the status is re-queried afterwards
    pub fn start_method_profiling(&self, remote_path: &str, buffer_size: i32, flags: i32) -> Result<u32> {
        self.data().pending_method_profiling_file = Some(remote_path.to_string());
        let id = self.send_chunk(
            ProfilingRequest::StartFile {
                path: remote_path.to_string(),
                buffer_size,
                flags,
            }
            .encode(),
        )?;
        self.request_method_profiling_status()?;
        Ok(id)
    }

    pub fn stop_method_profiling(&self) -> Result<u32> {
        self.send_chunk(ProfilingRequest::StopFile.encode())
    }

    pub fn start_streaming_method_profiling(&self, buffer_size: i32, flags: i32) -> Result<u32> {
        let id = self.send_chunk(ProfilingRequest::StartStreaming { buffer_size, flags }.encode())?;
        self.request_method_profiling_status()?;
        Ok(id)
    }

    pub fn stop_streaming_method_profiling(&self) -> Result<u32> {
        self.send_chunk(ProfilingRequest::StopStreaming.encode())
    }

    pub fn start_sampling_profiler(&self, buffer_size: i32, interval_us: i32) -> Result<u32> {
        let id = self.send_chunk(
            ProfilingRequest::StartSampling {
                buffer_size,
                interval_us,
            }
            .encode(),
        )?;
        self.request_method_profiling_status()?;
        Ok(id)
    }

    pub fn stop_sampling_profiler(&self) -> Result<u32> {
        self.send_chunk(ProfilingRequest::StopSampling.encode())
    }

    pub fn request_method_profiling_status(&self) -> Result<u32> {
        self.send_chunk(ProfilingRequest::QueryStatus.encode())
    }
}
