//! Core types and the traits at the engine's boundaries

pub mod listener;
pub mod types;

pub use listener::{
    AllocationTrackingHandler, BridgeLauncher, Collaborators, DebugPortProvider, DeviceListener,
    EmulatorConsole, HprofDumpHandler, Listeners, MethodProfilingHandler, TelemetrySink,
};
pub use types::{
    AllocationTrackingStatus, ClientKey, DebuggerStatus, DeviceChange, DeviceState,
    MethodProfilingStatus,
};
