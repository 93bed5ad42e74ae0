//! Identity value types and status enums shared across the engine

use std::fmt;

/// Device connection state as reported by the bridge daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Bootloader,
    Offline,
    Online,
    Recovery,
    Unauthorized,
}

impl DeviceState {
    /// Parse the state column of a `host:track-devices` line
    pub fn from_bridge(state: &str) -> Option<Self> {
        match state {
            "bootloader" => Some(DeviceState::Bootloader),
            "offline" => Some(DeviceState::Offline),
            "device" => Some(DeviceState::Online),
            "recovery" => Some(DeviceState::Recovery),
            "unauthorized" => Some(DeviceState::Unauthorized),
            _ => None,
        }
    }

    /// Wire string for this state
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Bootloader => "bootloader",
            DeviceState::Offline => "offline",
            DeviceState::Online => "device",
            DeviceState::Recovery => "recovery",
            DeviceState::Unauthorized => "unauthorized",
        }
    }

    pub fn is_online(&self) -> bool {
        *self == DeviceState::Online
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a client session: device serial plus process id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey {
    pub serial: String,
    pub pid: u32,
}

impl ClientKey {
    pub fn new(serial: impl Into<String>, pid: u32) -> Self {
        Self {
            serial: serial.into(),
            pid,
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.serial, self.pid)
    }
}

/// Debugger attachment status of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebuggerStatus {
    /// No debugger attached
    #[default]
    Default,
    /// Application is waiting for a debugger
    Waiting,
    /// A debugger is attached through the forwarding port
    Attached,
    /// The forwarding port could not be opened
    Error,
}

/// Allocation tracking status reported by REAQ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationTrackingStatus {
    #[default]
    Unknown,
    Off,
    On,
}

/// Method profiling status reported by MPRQ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MethodProfilingStatus {
    #[default]
    Unknown,
    Off,
    TracerOn,
    SamplerOn,
}

impl MethodProfilingStatus {
    pub fn from_wire(value: u8) -> Self {
        match value {
            0 => MethodProfilingStatus::Off,
            1 => MethodProfilingStatus::TracerOn,
            2 => MethodProfilingStatus::SamplerOn,
            _ => MethodProfilingStatus::Unknown,
        }
    }
}

/// What changed on a device when a listener is notified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChange {
    State,
    Name,
    ClientList,
}
