//! Session info: HELO, FEAT, APNM and WAIT

use crate::chunk::packet::Chunk;
use crate::chunk::registry::ChunkHandler;
use crate::chunk::types::ChunkType;
use crate::client::ClientSession;
use crate::codec::{ByteReader, ByteWriter};
use crate::core::listener::Listeners;
use crate::core::types::DebuggerStatus;
use crate::error::{Error, Result};

pub const HELO: ChunkType = ChunkType::from_tag(b"HELO");
pub const FEAT: ChunkType = ChunkType::from_tag(b"FEAT");
pub const APNM: ChunkType = ChunkType::from_tag(b"APNM");
pub const WAIT: ChunkType = ChunkType::from_tag(b"WAIT");

const SERVER_PROTOCOL_VERSION: i32 = 1;

/// Placeholder name sent before the application is bound
const PRE_INITIALIZED: &str = "<pre-initialized>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloRequest {
    Hello,
    Features,
}

impl HelloRequest {
    pub fn encode(&self) -> Chunk {
        match self {
            HelloRequest::Hello => {
                let mut writer = ByteWriter::new();
                writer.i32(SERVER_PROTOCOL_VERSION);
                Chunk::new(HELO, writer.into_inner())
            }
            HelloRequest::Features => Chunk::empty(FEAT),
        }
    }
}

/// HELO reply contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloInfo {
    pub version: i32,
    pub pid: i32,
    pub vm_identifier: String,
    pub app_name: String,
    pub user_id: Option<i32>,
    pub abi: Option<String>,
    pub jvm_flags: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloEvent {
    Hello(HelloInfo),
    Features(Vec<String>),
    AppName { name: String, user_id: Option<i32> },
    Wait { reason: u8 },
}

impl HelloEvent {
    pub fn decode(chunk: &Chunk) -> Result<Self> {
        let mut reader = ByteReader::new(&chunk.payload);
        match chunk.kind {
            HELO => {
                let version = reader.i32()?;
                let pid = reader.i32()?;
                let vm_len = reader.i32()?.max(0) as usize;
                let name_len = reader.i32()?.max(0) as usize;
                let vm_identifier = reader.utf16(vm_len)?;
                let app_name = reader.utf16(name_len)?;

                let user_id = optional_i32(&mut reader)?;
                let abi = optional_string(&mut reader)?;
                let jvm_flags = optional_string(&mut reader)?;

                Ok(HelloEvent::Hello(HelloInfo {
                    version,
                    pid,
                    vm_identifier,
                    app_name,
                    user_id,
                    abi,
                    jvm_flags,
                }))
            }
            FEAT => {
                let count = reader.i32()?.max(0) as usize;
                let mut features = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    features.push(reader.string()?);
                }
                Ok(HelloEvent::Features(features))
            }
            APNM => {
                let name = reader.string()?;
                let user_id = optional_i32(&mut reader)?;
                Ok(HelloEvent::AppName { name, user_id })
            }
            WAIT => Ok(HelloEvent::Wait {
                reason: reader.u8()?,
            }),
            other => Err(Error::UnknownChunk(other.name())),
        }
    }
}

fn optional_i32(reader: &mut ByteReader<'_>) -> Result<Option<i32>> {
    if reader.remaining() >= 4 {
        Ok(Some(reader.i32()?))
    } else {
        Ok(None)
    }
}

fn optional_string(reader: &mut ByteReader<'_>) -> Result<Option<String>> {
    if reader.remaining() >= 4 {
        Ok(Some(reader.string()?))
    } else {
        Ok(None)
    }
}

/// Sends HELO and FEAT on registration and records the replies
pub struct HelloHandler {
    listeners: Listeners,
}

impl HelloHandler {
    pub fn new(listeners: Listeners) -> Self {
        Self { listeners }
    }

    fn apply(&self, client: &ClientSession, event: HelloEvent) {
        match event {
            HelloEvent::Hello(info) => {
                if info.pid >= 0 && info.pid as u32 != client.pid() {
                    log::warn!(
                        "{}: HELO reports pid {}, expected {}",
                        client.key(),
                        info.pid,
                        client.pid()
                    );
                }
                log::info!(
                    "{}: {} (vm {}, protocol {})",
                    client.key(),
                    info.app_name,
                    info.vm_identifier,
                    info.version
                );
                let app_name = {
                    let mut data = client.data();
                    data.vm_identifier = Some(info.vm_identifier);
                    if info.app_name != PRE_INITIALIZED {
                        data.description = Some(info.app_name);
                    }
                    if info.user_id.is_some() {
                        data.user_id = info.user_id;
                    }
                    if info.abi.is_some() {
                        data.abi = info.abi;
                    }
                    if info.jvm_flags.is_some() {
                        data.jvm_flags = info.jvm_flags;
                    }
                    data.description.clone()
                };
                self.listeners.telemetry(|s| s.client_info(client));

                if let Some(name) = app_name {
                    client.apply_static_port(&name);
                }
            }
            HelloEvent::Features(features) => {
                log::debug!("{}: features {:?}", client.key(), features);
                client.data().features.extend(features);
                self.listeners.telemetry(|s| s.client_info(client));
            }
            HelloEvent::AppName { name, user_id } => {
                {
                    let mut data = client.data();
                    if name != PRE_INITIALIZED {
                        data.description = Some(name.clone());
                    }
                    if user_id.is_some() {
                        data.user_id = user_id;
                    }
                }
                self.listeners.telemetry(|s| s.client_info(client));
                if name != PRE_INITIALIZED {
                    client.apply_static_port(&name);
                }
            }
            HelloEvent::Wait { reason } => {
                log::debug!("{}: waiting for debugger (reason {})", client.key(), reason);
                client.data().debugger_status = DebuggerStatus::Waiting;
                self.listeners
                    .telemetry(|s| s.debugger_status(client, DebuggerStatus::Waiting));
            }
        }
    }
}

impl ChunkHandler for HelloHandler {
    fn name(&self) -> &'static str {
        "hello"
    }

    fn chunk_types(&self) -> &'static [ChunkType] {
        &[HELO, FEAT, APNM, WAIT]
    }

    fn client_ready(&self, client: &ClientSession) -> Result<()> {
        client.send_chunk(HelloRequest::Hello.encode())?;
        client.send_chunk(HelloRequest::Features.encode())?;
        Ok(())
    }

    fn handle_chunk(
        &self,
        client: &ClientSession,
        chunk: &Chunk,
        _is_reply: bool,
        _msg_id: u32,
    ) -> Result<()> {
        let event = HelloEvent::decode(chunk)?;
        self.apply(client, event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::handlers::test_support::EventLog;
    use crate::core::types::ClientKey;
    use std::sync::Arc;

    fn hello_payload(pid: i32, name: &str, extras: bool) -> Vec<u8> {
        let vm = "ART 2.1.0";
        let mut writer = ByteWriter::new();
        writer
            .i32(1)
            .i32(pid)
            .i32(vm.encode_utf16().count() as i32)
            .i32(name.encode_utf16().count() as i32)
            .utf16(vm)
            .utf16(name);
        if extras {
            writer.i32(10_123).string("arm64-v8a").string("-Xcheck:jni");
        }
        writer.into_inner()
    }

    fn handler_with_log() -> (HelloHandler, Arc<EventLog>) {
        let log = Arc::new(EventLog::default());
        let listeners = Listeners {
            telemetry: vec![log.clone()],
            ..Listeners::default()
        };
        (HelloHandler::new(listeners), log)
    }

    #[test]
    fn test_hello_request_layout() {
        let chunk = HelloRequest::Hello.encode();
        assert_eq!(chunk.kind, HELO);
        assert_eq!(chunk.payload, vec![0, 0, 0, 1]);
        assert!(HelloRequest::Features.encode().payload.is_empty());
    }

    #[test]
    fn test_decode_hello_with_extras() {
        let chunk = Chunk::new(HELO, hello_payload(42, "com.example.app", true));
        let HelloEvent::Hello(info) = HelloEvent::decode(&chunk).unwrap() else {
            panic!("expected hello");
        };
        assert_eq!(info.pid, 42);
        assert_eq!(info.vm_identifier, "ART 2.1.0");
        assert_eq!(info.app_name, "com.example.app");
        assert_eq!(info.user_id, Some(10_123));
        assert_eq!(info.abi.as_deref(), Some("arm64-v8a"));
        assert_eq!(info.jvm_flags.as_deref(), Some("-Xcheck:jni"));
    }

    #[test]
    fn test_decode_hello_minimal() {
        let chunk = Chunk::new(HELO, hello_payload(7, "app", false));
        let HelloEvent::Hello(info) = HelloEvent::decode(&chunk).unwrap() else {
            panic!("expected hello");
        };
        assert_eq!(info.user_id, None);
        assert_eq!(info.abi, None);
    }

    #[test]
    fn test_truncated_hello_is_error() {
        let mut payload = hello_payload(7, "app", false);
        payload.truncate(payload.len() - 2);
        assert!(HelloEvent::decode(&Chunk::new(HELO, payload)).is_err());
    }

    #[test]
    fn test_hello_updates_client_data() {
        let (handler, log) = handler_with_log();
        let client = ClientSession::detached(ClientKey::new("emulator-5554", 42));
        let chunk = Chunk::new(HELO, hello_payload(42, "com.example.app", true));
        handler.handle_chunk(&client, &chunk, true, 1).unwrap();

        let data = client.data().clone();
        assert_eq!(data.description.as_deref(), Some("com.example.app"));
        assert_eq!(data.abi.as_deref(), Some("arm64-v8a"));
        assert_eq!(log.take(), vec!["client_info com.example.app".to_string()]);
    }

    #[test]
    fn test_pre_initialized_name_ignored() {
        let (handler, _log) = handler_with_log();
        let client = ClientSession::detached(ClientKey::new("a", 9));
        let chunk = Chunk::new(HELO, hello_payload(9, PRE_INITIALIZED, false));
        handler.handle_chunk(&client, &chunk, true, 1).unwrap();
        assert_eq!(client.data().description, None);
        assert!(client.data().vm_identifier.is_some());
    }

    #[test]
    fn test_features_and_wait() {
        let (handler, log) = handler_with_log();
        let client = ClientSession::detached(ClientKey::new("a", 9));

        let mut writer = ByteWriter::new();
        writer.i32(2).string("method-trace-profiling").string("view-hierarchy");
        handler
            .handle_chunk(&client, &Chunk::new(FEAT, writer.into_inner()), true, 2)
            .unwrap();
        assert!(client.data().has_feature("view-hierarchy"));

        handler
            .handle_chunk(&client, &Chunk::new(WAIT, vec![0]), false, 3)
            .unwrap();
        assert_eq!(client.data().debugger_status, DebuggerStatus::Waiting);
        assert_eq!(log.take().last().unwrap(), "debugger_status Waiting");
    }

    #[test]
    fn test_app_name_event() {
        let (handler, _log) = handler_with_log();
        let client = ClientSession::detached(ClientKey::new("a", 9));

        let mut writer = ByteWriter::new();
        writer.string("com.example.late").i32(0);
        handler
            .handle_chunk(&client, &Chunk::new(APNM, writer.into_inner()), false, 4)
            .unwrap();
        assert_eq!(client.data().description.as_deref(), Some("com.example.late"));
        assert_eq!(client.data().user_id, Some(0));
    }

    #[test]
    fn test_client_ready_sends_hello_and_features() {
        let (handler, _log) = handler_with_log();
        let client = ClientSession::detached(ClientKey::new("a", 9));
        handler.client_ready(&client).unwrap();
        let kinds: Vec<ChunkType> = client.take_sent().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![HELO, FEAT]);
    }
}
