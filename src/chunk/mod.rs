//! DDM chunk protocol
//!
//! Framing of JDWP packets and DDM chunks, the handler registry, the shared
//! dispatch loop and the built-in handlers.

pub mod dispatch;
pub mod handlers;
pub mod packet;
pub mod registry;
pub mod types;

pub use dispatch::{DispatchCommand, DispatchHandle};
pub use packet::{Chunk, JdwpPacket, PacketReader};
pub use registry::{ChunkHandler, HandlerRegistry};
pub use types::ChunkType;
