//! Bridge daemon access
//!
//! Request framing and blocking request/response helpers, incremental block
//! reassembly for readiness loops, and the restart and emulator console
//! collaborators.

pub mod emulator;
pub mod framing;
pub mod launcher;
pub mod protocol;

pub use emulator::TcpEmulatorConsole;
pub use framing::FrameBuffer;
pub use launcher::AdbServerLauncher;
pub use protocol::{AdbResponse, form_request, read_length_prefixed, read_response};
