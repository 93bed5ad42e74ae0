//! Sinks and collaborators injected into the engine
//!
//! Listeners receive device and telemetry events from the loop threads.
//! Callbacks run on those threads, so they must return quickly and must not
//! call back into blocking engine operations.

use crate::client::ClientSession;
use crate::codec::{AllocationRecord, HeapInfo, HeapSegment, NativeHeapSnapshot};
use crate::core::types::{
    AllocationTrackingStatus, DebuggerStatus, DeviceChange, MethodProfilingStatus,
};
use crate::devices::DeviceInfo;
use std::sync::Arc;

/// Device lifecycle events
pub trait DeviceListener: Send + Sync {
    fn device_connected(&self, _device: &DeviceInfo) {}
    fn device_disconnected(&self, _device: &DeviceInfo) {}
    fn device_changed(&self, _device: &DeviceInfo, _change: DeviceChange) {}
}

/// Decoded telemetry for a client
pub trait TelemetrySink: Send + Sync {
    fn heap_info(&self, _client: &ClientSession, _info: &HeapInfo) {}
    fn heap_segments(&self, _client: &ClientSession, _segments: &[HeapSegment]) {}
    fn allocation_status(&self, _client: &ClientSession, _status: AllocationTrackingStatus) {}
    fn allocations(&self, _client: &ClientSession, _records: &[AllocationRecord]) {}
    fn method_profiling_status(&self, _client: &ClientSession, _status: MethodProfilingStatus) {}
    fn native_heap(&self, _client: &ClientSession, _snapshot: &NativeHeapSnapshot) {}
    fn native_heap_segments(&self, _client: &ClientSession, _segments: &[HeapSegment]) {}
    /// Name, vm identifier, abi or feature list changed
    fn client_info(&self, _client: &ClientSession) {}
    fn debugger_status(&self, _client: &ClientSession, _status: DebuggerStatus) {}
}

/// Results of method profiling requests
pub trait MethodProfilingHandler: Send + Sync {
    /// Trace written to a file on the device
    fn on_success_file(&self, remote_path: &str, client: &ClientSession);
    /// Trace streamed back to the host
    fn on_success_data(&self, data: &[u8], client: &ClientSession);
    fn on_start_failure(&self, client: &ClientSession, message: Option<&str>);
    fn on_end_failure(&self, client: &ClientSession, message: Option<&str>);
}

/// Results of hprof dump requests
pub trait HprofDumpHandler: Send + Sync {
    fn on_success_file(&self, remote_path: &str, client: &ClientSession);
    fn on_success_data(&self, data: &[u8], client: &ClientSession);
    fn on_end_failure(&self, client: &ClientSession, message: Option<&str>);
}

/// Raw allocation reports; when present the REAL payload is not decoded
pub trait AllocationTrackingHandler: Send + Sync {
    fn on_success(&self, data: &[u8], client: &ClientSession);
}

/// Restarts the bridge daemon after repeated connection failures
pub trait BridgeLauncher: Send + Sync {
    fn restart(&self) -> bool;
}

/// Looks up the AVD name of an emulator serial
pub trait EmulatorConsole: Send + Sync {
    fn avd_name(&self, serial: &str) -> Option<String>;
}

/// Static debugger ports for known applications
pub trait DebugPortProvider: Send + Sync {
    fn port_for(&self, serial: &str, app_name: &str) -> Option<u16>;
}

/// Every sink the engine reports to
#[derive(Clone, Default)]
pub struct Listeners {
    pub devices: Vec<Arc<dyn DeviceListener>>,
    pub telemetry: Vec<Arc<dyn TelemetrySink>>,
    pub method_profiling: Option<Arc<dyn MethodProfilingHandler>>,
    pub hprof: Option<Arc<dyn HprofDumpHandler>>,
    pub allocation_tracking: Option<Arc<dyn AllocationTrackingHandler>>,
}

impl Listeners {
    pub fn device_connected(&self, device: &DeviceInfo) {
        for listener in &self.devices {
            listener.device_connected(device);
        }
    }

    pub fn device_disconnected(&self, device: &DeviceInfo) {
        for listener in &self.devices {
            listener.device_disconnected(device);
        }
    }

    pub fn device_changed(&self, device: &DeviceInfo, change: DeviceChange) {
        for listener in &self.devices {
            listener.device_changed(device, change);
        }
    }

    /// Run `f` against every telemetry sink
    pub fn telemetry(&self, f: impl Fn(&dyn TelemetrySink)) {
        for sink in &self.telemetry {
            f(sink.as_ref());
        }
    }
}

/// External operations the engine delegates
#[derive(Clone, Default)]
pub struct Collaborators {
    pub launcher: Option<Arc<dyn BridgeLauncher>>,
    pub emulator_console: Option<Arc<dyn EmulatorConsole>>,
    pub debug_ports: Option<Arc<dyn DebugPortProvider>>,
}
