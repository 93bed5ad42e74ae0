//! ddm-bridge - Device and process monitor daemon
//!
//! Connects to the bridge daemon, tracks devices and their debuggable
//! processes, and logs device events and client telemetry until Ctrl-C.

use ddm_bridge::adb::{AdbServerLauncher, TcpEmulatorConsole};
use ddm_bridge::client::ClientSession;
use ddm_bridge::codec::{HeapInfo, NativeHeapSnapshot};
use ddm_bridge::core::{
    AllocationTrackingStatus, Collaborators, DebuggerStatus, DeviceChange, DeviceListener,
    Listeners, MethodProfilingStatus, TelemetrySink,
};
use ddm_bridge::devices::DeviceInfo;
use ddm_bridge::{Config, Engine, Error, Result};
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Parse config path from command line arguments.
///
/// Supports:
/// - `ddm-bridge <path>` (positional)
/// - `ddm-bridge --config <path>` (flag-based)
/// - `ddm-bridge -c <path>` (short flag)
///
/// Returns `None` to run with built-in defaults.
fn parse_config_path() -> Option<String> {
    let args: Vec<String> = env::args().collect();

    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }

    if args.len() > 1 && !args[1].starts_with('-') {
        return Some(args[1].clone());
    }

    None
}

struct LogListener;

impl DeviceListener for LogListener {
    fn device_connected(&self, device: &DeviceInfo) {
        log::info!("+ {} [{}]", device.serial, device.state.as_str());
    }

    fn device_disconnected(&self, device: &DeviceInfo) {
        log::info!("- {}", device.serial);
    }

    fn device_changed(&self, device: &DeviceInfo, change: DeviceChange) {
        match change {
            DeviceChange::State => log::info!("~ {} [{}]", device.serial, device.state.as_str()),
            DeviceChange::Name => log::info!(
                "~ {} is {}",
                device.serial,
                device.name.as_deref().unwrap_or("?")
            ),
            DeviceChange::ClientList => log::debug!("~ {} clients changed", device.serial),
        }
    }
}

impl TelemetrySink for LogListener {
    fn client_info(&self, client: &ClientSession) {
        let data = client.data();
        log::info!(
            "{}: {} ({})",
            client.key(),
            data.description.as_deref().unwrap_or("<unknown>"),
            data.vm_identifier.as_deref().unwrap_or("-")
        );
    }

    fn heap_info(&self, client: &ClientSession, info: &HeapInfo) {
        log::debug!(
            "{}: heap {} {}/{} bytes",
            client.key(),
            info.heap_id,
            info.bytes_allocated,
            info.size
        );
    }

    fn allocation_status(&self, client: &ClientSession, status: AllocationTrackingStatus) {
        log::debug!("{}: allocation tracking {:?}", client.key(), status);
    }

    fn method_profiling_status(&self, client: &ClientSession, status: MethodProfilingStatus) {
        log::debug!("{}: method profiling {:?}", client.key(), status);
    }

    fn native_heap(&self, client: &ClientSession, snapshot: &NativeHeapSnapshot) {
        log::debug!(
            "{}: native heap {} bytes, {} allocation records",
            client.key(),
            snapshot.total_memory,
            snapshot.allocations.len()
        );
    }

    fn debugger_status(&self, client: &ClientSession, status: DebuggerStatus) {
        log::info!(
            "{}: debugger {:?} (port {:?})",
            client.key(),
            status,
            client.debugger_port()
        );
    }
}

fn main() -> Result<()> {
    let config_path = parse_config_path();
    let config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    log::info!("ddm-bridge v{} starting...", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => log::info!("Using config: {}", path),
        None => log::info!("Using built-in defaults"),
    }
    log::info!("Bridge daemon: {}", config.bridge.address);

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    let sink = Arc::new(LogListener);
    let listeners = Listeners {
        devices: vec![sink.clone()],
        telemetry: vec![sink],
        ..Listeners::default()
    };
    let collaborators = Collaborators {
        launcher: Some(Arc::new(AdbServerLauncher::new(config.bridge.adb_path.clone()))),
        emulator_console: Some(Arc::new(TcpEmulatorConsole::new(
            config.bridge.connect_timeout(),
        ))),
        debug_ports: None,
    };

    let mut engine = Engine::new(config, listeners, collaborators)?;
    engine.start()?;
    log::info!("ddm-bridge running. Press Ctrl-C to stop.");

    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }

    log::info!("Shutting down...");
    engine.stop();
    log::info!("ddm-bridge stopped");
    Ok(())
}
