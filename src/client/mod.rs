//! Client sessions and their per-process state

pub mod data;
pub mod handshake;
pub mod ports;
pub mod session;

pub use data::{ClientData, HeapData};
pub use ports::DebuggerPortPool;
pub use session::ClientSession;
