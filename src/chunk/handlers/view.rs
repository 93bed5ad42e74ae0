//! View hierarchy debugging: VUGL, VULW, VURT, VUOP
//!
//! Requests that produce data return a [`ViewReply`] resolved by the
//! matching reply packet. The rest are sent without waiting.

use super::{FAIL, Failure};
use crate::chunk::packet::Chunk;
use crate::chunk::registry::ChunkHandler;
use crate::chunk::types::ChunkType;
use crate::client::ClientSession;
use crate::codec::ByteWriter;
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const VUGL: ChunkType = ChunkType::from_tag(b"VUGL");
pub const VULW: ChunkType = ChunkType::from_tag(b"VULW");
pub const VURT: ChunkType = ChunkType::from_tag(b"VURT");
pub const VUOP: ChunkType = ChunkType::from_tag(b"VUOP");

const VURT_DUMP_HIERARCHY: i32 = 1;
const VURT_CAPTURE_LAYERS: i32 = 2;
const VURT_DUMP_THEME: i32 = 3;

const VUOP_CAPTURE_VIEW: i32 = 1;
const VUOP_DUMP_DISPLAYLIST: i32 = 2;
const VUOP_PROFILE_VIEW: i32 = 3;
const VUOP_INVOKE_VIEW_METHOD: i32 = 4;
const VUOP_SET_LAYOUT_PARAMETER: i32 = 5;

/// Argument to a remote view method
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewMethodArg {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
}

impl ViewMethodArg {
    fn write(&self, writer: &mut ByteWriter) {
        match *self {
            ViewMethodArg::Boolean(v) => writer.u16(u16::from(b'Z')).u8(u8::from(v)),
            ViewMethodArg::Byte(v) => writer.u16(u16::from(b'B')).u8(v as u8),
            ViewMethodArg::Char(v) => writer.u16(u16::from(b'C')).u16(v),
            ViewMethodArg::Short(v) => writer.u16(u16::from(b'S')).i16(v),
            ViewMethodArg::Int(v) => writer.u16(u16::from(b'I')).i32(v),
            ViewMethodArg::Long(v) => writer.u16(u16::from(b'J')).i64(v),
            ViewMethodArg::Float(v) => writer.u16(u16::from(b'F')).u32(v.to_bits()),
            ViewMethodArg::Double(v) => writer.u16(u16::from(b'D')).u64(v.to_bits()),
        };
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewRequest {
    EnableOpenGlTracing(bool),
    ListViewRoots,
    DumpHierarchy {
        root: String,
        skip_children: bool,
        include_properties: bool,
    },
    CaptureLayers {
        root: String,
    },
    DumpTheme {
        root: String,
    },
    CaptureView {
        root: String,
        view: String,
    },
    DumpDisplayList {
        root: String,
        view: String,
    },
    ProfileView {
        root: String,
        view: String,
    },
    InvokeMethod {
        root: String,
        view: String,
        method: String,
        args: Vec<ViewMethodArg>,
    },
    SetLayoutParameter {
        root: String,
        view: String,
        parameter: String,
        value: i32,
    },
}

impl ViewRequest {
    pub fn encode(&self) -> Chunk {
        let mut writer = ByteWriter::new();
        let kind = match self {
            ViewRequest::EnableOpenGlTracing(enable) => {
                writer.i32(i32::from(*enable));
                VUGL
            }
            ViewRequest::ListViewRoots => {
                writer.i32(1);
                VULW
            }
            ViewRequest::DumpHierarchy {
                root,
                skip_children,
                include_properties,
            } => {
                writer
                    .i32(VURT_DUMP_HIERARCHY)
                    .string(root)
                    .i32(i32::from(*skip_children))
                    .i32(i32::from(*include_properties));
                VURT
            }
            ViewRequest::CaptureLayers { root } => {
                writer.i32(VURT_CAPTURE_LAYERS).string(root);
                VURT
            }
            ViewRequest::DumpTheme { root } => {
                writer.i32(VURT_DUMP_THEME).string(root);
                VURT
            }
            ViewRequest::CaptureView { root, view } => {
                writer.i32(VUOP_CAPTURE_VIEW).string(root).string(view);
                VUOP
            }
            ViewRequest::DumpDisplayList { root, view } => {
                writer.i32(VUOP_DUMP_DISPLAYLIST).string(root).string(view);
                VUOP
            }
            ViewRequest::ProfileView { root, view } => {
                writer.i32(VUOP_PROFILE_VIEW).string(root).string(view);
                VUOP
            }
            ViewRequest::InvokeMethod {
                root,
                view,
                method,
                args,
            } => {
                writer
                    .i32(VUOP_INVOKE_VIEW_METHOD)
                    .string(root)
                    .string(view)
                    .string(method)
                    .i32(args.len() as i32);
                for arg in args {
                    arg.write(&mut writer);
                }
                VUOP
            }
            ViewRequest::SetLayoutParameter {
                root,
                view,
                parameter,
                value,
            } => {
                writer
                    .i32(VUOP_SET_LAYOUT_PARAMETER)
                    .string(root)
                    .string(view)
                    .string(parameter)
                    .i32(*value);
                VUOP
            }
        };
        Chunk::new(kind, writer.into_inner())
    }
}

/// Outcome delivered to a waiting [`ViewReply`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewResponse {
    Data(Vec<u8>),
    Failed(String),
}

/// Pending result of a view debug request
pub struct ViewReply {
    id: u32,
    receiver: Receiver<ViewResponse>,
}

impl ViewReply {
    /// Request id the reply is matched against
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn wait(&self, timeout: Duration) -> Result<ViewResponse> {
        match self.receiver.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionClosed),
        }
    }

    pub fn try_get(&self) -> Option<ViewResponse> {
        self.receiver.try_recv().ok()
    }
}

/// Receives exactly one reply, then ignores the rest
struct OneShotHandler {
    sender: Mutex<Option<Sender<ViewResponse>>>,
}

impl ChunkHandler for OneShotHandler {
    fn name(&self) -> &'static str {
        "view-reply"
    }

    fn chunk_types(&self) -> &'static [ChunkType] {
        &[]
    }

    fn handle_chunk(
        &self,
        client: &ClientSession,
        chunk: &Chunk,
        _is_reply: bool,
        _msg_id: u32,
    ) -> Result<()> {
        let Some(sender) = self.sender.lock().take() else {
            return Ok(());
        };
        let response = if chunk.kind == FAIL {
            let failure = Failure::decode(&chunk.payload)?;
            log::warn!("{}: view request failed: {}", client.key(), failure.message);
            ViewResponse::Failed(failure.message)
        } else {
            ViewResponse::Data(chunk.payload.clone())
        };
        // Caller may have stopped waiting
        let _ = sender.send(response);
        Ok(())
    }

    fn client_disconnected(&self, _client: &ClientSession) {
        self.sender.lock().take();
    }
}

fn one_shot() -> (Arc<OneShotHandler>, Receiver<ViewResponse>) {
    let (sender, receiver) = bounded(1);
    let handler = Arc::new(OneShotHandler {
        sender: Mutex::new(Some(sender)),
    });
    (handler, receiver)
}

/// Owner of view tags for replies nobody is waiting for
pub struct ViewDebugHandler;

impl ChunkHandler for ViewDebugHandler {
    fn name(&self) -> &'static str {
        "view-debug"
    }

    fn chunk_types(&self) -> &'static [ChunkType] {
        &[VUGL, VULW, VURT, VUOP]
    }

    fn handle_chunk(
        &self,
        client: &ClientSession,
        chunk: &Chunk,
        _is_reply: bool,
        _msg_id: u32,
    ) -> Result<()> {
        log::debug!(
            "{}: unrequested {} reply ({} bytes)",
            client.key(),
            chunk.kind,
            chunk.payload.len()
        );
        Ok(())
    }
}

impl ClientSession {
    fn send_view_request(&self, request: ViewRequest) -> Result<ViewReply> {
        let (handler, receiver) = one_shot();
        let id = self.send_chunk_with_handler(request.encode(), handler)?;
        Ok(ViewReply { id, receiver })
    }

    pub fn enable_opengl_tracing(&self, enable: bool) -> Result<u32> {
        self.send_chunk(ViewRequest::EnableOpenGlTracing(enable).encode())
    }

    pub fn list_view_roots(&self) -> Result<ViewReply> {
        self.send_view_request(ViewRequest::ListViewRoots)
    }

    pub fn dump_view_hierarchy(
        &self,
        root: &str,
        skip_children: bool,
        include_properties: bool,
    ) -> Result<ViewReply> {
        self.send_view_request(ViewRequest::DumpHierarchy {
            root: root.to_string(),
            skip_children,
            include_properties,
        })
    }

    pub fn capture_layers(&self, root: &str) -> Result<ViewReply> {
        self.send_view_request(ViewRequest::CaptureLayers {
            root: root.to_string(),
        })
    }

    pub fn dump_theme(&self, root: &str) -> Result<ViewReply> {
        self.send_view_request(ViewRequest::DumpTheme {
            root: root.to_string(),
        })
    }

    pub fn capture_view(&self, root: &str, view: &str) -> Result<ViewReply> {
        self.send_view_request(ViewRequest::CaptureView {
            root: root.to_string(),
            view: view.to_string(),
        })
    }

    pub fn profile_view(&self, root: &str, view: &str) -> Result<ViewReply> {
        self.send_view_request(ViewRequest::ProfileView {
            root: root.to_string(),
            view: view.to_string(),
        })
    }

    /// Output goes to the device log
    pub fn dump_display_list(&self, root: &str, view: &str) -> Result<u32> {
        self.send_chunk(
            ViewRequest::DumpDisplayList {
                root: root.to_string(),
                view: view.to_string(),
            }
            .encode(),
        )
    }

    pub fn invoke_view_method(
        &self,
        root: &str,
        view: &str,
        method: &str,
        args: &[ViewMethodArg],
    ) -> Result<u32> {
        self.send_chunk(
            ViewRequest::InvokeMethod {
                root: root.to_string(),
                view: view.to_string(),
                method: method.to_string(),
                args: args.to_vec(),
            }
            .encode(),
        )
    }

    pub fn set_layout_parameter(
        &self,
        root: &str,
        view: &str,
        parameter: &str,
        value: i32,
    ) -> Result<u32> {
        self.send_chunk(
            ViewRequest::SetLayoutParameter {
                root: root.to_string(),
                view: view.to_string(),
                parameter: parameter.to_string(),
                value,
            }
            .encode(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteReader;
    use crate::core::types::ClientKey;

    #[test]
    fn test_dump_hierarchy_layout() {
        let chunk = ViewRequest::DumpHierarchy {
            root: "Main".to_string(),
            skip_children: false,
            include_properties: true,
        }
        .encode();
        assert_eq!(chunk.kind, VURT);
        let mut reader = ByteReader::new(&chunk.payload);
        assert_eq!(reader.i32().unwrap(), VURT_DUMP_HIERARCHY);
        assert_eq!(reader.string().unwrap(), "Main");
        assert_eq!(reader.i32().unwrap(), 0);
        assert_eq!(reader.i32().unwrap(), 1);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_invoke_method_arguments() {
        let chunk = ViewRequest::InvokeMethod {
            root: "r".to_string(),
            view: "v".to_string(),
            method: "setEnabled".to_string(),
            args: vec![ViewMethodArg::Boolean(true), ViewMethodArg::Int(-2)],
        }
        .encode();
        let mut reader = ByteReader::new(&chunk.payload);
        assert_eq!(reader.i32().unwrap(), VUOP_INVOKE_VIEW_METHOD);
        assert_eq!(reader.string().unwrap(), "r");
        assert_eq!(reader.string().unwrap(), "v");
        assert_eq!(reader.string().unwrap(), "setEnabled");
        assert_eq!(reader.i32().unwrap(), 2);
        assert_eq!(reader.u16().unwrap(), u16::from(b'Z'));
        assert_eq!(reader.u8().unwrap(), 1);
        assert_eq!(reader.u16().unwrap(), u16::from(b'I'));
        assert_eq!(reader.i32().unwrap(), -2);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_set_layout_parameter_layout() {
        let chunk = ViewRequest::SetLayoutParameter {
            root: "r".to_string(),
            view: "v".to_string(),
            parameter: "width".to_string(),
            value: 320,
        }
        .encode();
        assert_eq!(chunk.kind, VUOP);
        assert_eq!(&chunk.payload[chunk.payload.len() - 4..], &320i32.to_be_bytes());
    }

    #[test]
    fn test_one_shot_delivers_once() {
        let (handler, receiver) = one_shot();
        let client = ClientSession::detached(ClientKey::new("a", 1));
        handler
            .handle_chunk(&client, &Chunk::new(VULW, vec![1, 2]), true, 5)
            .unwrap();
        handler
            .handle_chunk(&client, &Chunk::new(VULW, vec![3]), true, 5)
            .unwrap();

        let reply = ViewReply { id: 5, receiver };
        assert_eq!(reply.try_get(), Some(ViewResponse::Data(vec![1, 2])));
        assert_eq!(reply.try_get(), None);
    }

    #[test]
    fn test_one_shot_failure() {
        let (handler, receiver) = one_shot();
        let client = ClientSession::detached(ClientKey::new("a", 1));
        let mut writer = ByteWriter::new();
        writer.i32(1).string("no such view");
        handler
            .handle_chunk(&client, &Chunk::new(FAIL, writer.into_inner()), true, 5)
            .unwrap();

        let reply = ViewReply { id: 5, receiver };
        assert_eq!(
            reply.wait(Duration::from_millis(10)).unwrap(),
            ViewResponse::Failed("no such view".to_string())
        );
    }

    #[test]
    fn test_wait_reports_disconnect() {
        let (handler, receiver) = one_shot();
        let client = ClientSession::detached(ClientKey::new("a", 1));
        handler.client_disconnected(&client);
        let reply = ViewReply { id: 1, receiver };
        assert!(matches!(
            reply.wait(Duration::from_millis(10)),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_list_view_roots_sends_request() {
        let client = ClientSession::detached(ClientKey::new("a", 1));
        let reply = client.list_view_roots().unwrap();
        assert_eq!(reply.try_get(), None);
        assert_eq!(client.take_sent(), vec![Chunk::new(VULW, vec![0, 0, 0, 1])]);
    }
}
