//! Device discovery loop
//!
//! Holds a `host:track-devices` subscription open and reports every device
//! list block. Connection failures are retried after a delay; after enough
//! consecutive failures the daemon is restarted through the launcher.

use super::reconcile::DeviceSnapshot;
use crate::adb::framing::FrameBuffer;
use crate::adb::protocol::{self, TRACK_DEVICES};
use crate::config::{BridgeConfig, DiscoveryConfig};
use crate::core::listener::BridgeLauncher;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::io::{ErrorKind, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const READ_TICK: Duration = Duration::from_millis(500);
const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Receives the monitor's results
pub trait MonitorListener: Send + Sync {
    /// The subscription failed after having been established
    fn connection_error(&self, error: &Error);
    /// A complete device list arrived
    fn device_list_update(&self, snapshot: DeviceSnapshot);
}

pub struct DeviceMonitor {
    bridge: BridgeConfig,
    discovery: DiscoveryConfig,
    launcher: Option<Arc<dyn BridgeLauncher>>,
    listener: Arc<dyn MonitorListener>,
    quit: AtomicBool,
    monitoring: AtomicBool,
    connection_attempts: AtomicU32,
    restart_attempts: AtomicU32,
    initial_device_list: AtomicBool,
    /// Handle on the live subscription so `stop` can unblock a read
    socket: Mutex<Option<TcpStream>>,
}

impl DeviceMonitor {
    pub fn new(
        bridge: BridgeConfig,
        discovery: DiscoveryConfig,
        launcher: Option<Arc<dyn BridgeLauncher>>,
        listener: Arc<dyn MonitorListener>,
    ) -> Self {
        Self {
            bridge,
            discovery,
            launcher,
            listener,
            quit: AtomicBool::new(false),
            monitoring: AtomicBool::new(false),
            connection_attempts: AtomicU32::new(0),
            restart_attempts: AtomicU32::new(0),
            initial_device_list: AtomicBool::new(false),
            socket: Mutex::new(None),
        }
    }

    /// Run until [`stop`](Self::stop) is called
    pub fn run(&self) {
        log::info!("Device monitor started ({})", self.bridge.address);

        while !self.quit.load(Ordering::Acquire) {
            let mut stream = match self.open_subscription() {
                Ok(stream) => stream,
                Err(e) => {
                    log::debug!("Bridge daemon unavailable: {}", e);
                    self.connection_failed();
                    continue;
                }
            };

            self.connection_attempts.store(0, Ordering::Release);
            self.monitoring.store(true, Ordering::Release);
            match stream.try_clone() {
                Ok(handle) => *self.socket.lock() = Some(handle),
                Err(e) => log::warn!("Cannot keep subscription handle: {}", e),
            }
            // stop() may have run before the handle was stored
            if self.quit.load(Ordering::Acquire) {
                let _ = stream.shutdown(Shutdown::Both);
                break;
            }

            let result = self.read_device_lists(&mut stream);
            self.monitoring.store(false, Ordering::Release);
            self.socket.lock().take();
            let _ = stream.shutdown(Shutdown::Both);

            if let Err(e) = result
                && !self.quit.load(Ordering::Acquire)
            {
                log::warn!("Device monitor connection lost: {}", e);
                self.listener.connection_error(&e);
            }
        }

        log::info!("Device monitor stopped");
    }

    /// Ask the loop to exit and unblock it
    pub fn stop(&self) {
        self.quit.store(true, Ordering::Release);
        if let Some(socket) = self.socket.lock().take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::Acquire)
    }

    pub fn connection_attempt_count(&self) -> u32 {
        self.connection_attempts.load(Ordering::Acquire)
    }

    pub fn restart_attempt_count(&self) -> u32 {
        self.restart_attempts.load(Ordering::Acquire)
    }

    /// At least one device list was received
    pub fn has_initial_device_list(&self) -> bool {
        self.initial_device_list.load(Ordering::Acquire)
    }

    fn open_subscription(&self) -> Result<TcpStream> {
        let mut stream = protocol::connect(&self.bridge)?;
        protocol::request_okay(&mut stream, TRACK_DEVICES)?;
        stream.set_read_timeout(Some(READ_TICK))?;
        Ok(stream)
    }

    fn connection_failed(&self) {
        let attempts = self.connection_attempts.fetch_add(1, Ordering::AcqRel) + 1;

        if attempts > self.discovery.restart_after_attempts
            && let Some(launcher) = &self.launcher
        {
            log::warn!(
                "Bridge daemon unreachable after {} attempts, restarting it",
                attempts
            );
            if launcher.restart() {
                self.connection_attempts.store(0, Ordering::Release);
                self.restart_attempts.store(0, Ordering::Release);
            } else {
                let restarts = self.restart_attempts.fetch_add(1, Ordering::AcqRel) + 1;
                log::error!("Bridge daemon restart failed ({} so far)", restarts);
            }
        }

        self.pause(self.discovery.retry_delay());
    }

    fn pause(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while !self.quit.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }

    fn read_device_lists(&self, stream: &mut TcpStream) -> Result<()> {
        let mut frames = FrameBuffer::new();
        let mut buf = [0u8; 4096];

        while !self.quit.load(Ordering::Acquire) {
            let n = match stream.read(&mut buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            frames.extend(&buf[..n]);

            while let Some(frame) = frames.next_frame()? {
                let snapshot = DeviceSnapshot::parse(&String::from_utf8_lossy(&frame));
                log::debug!("Device list: {} device(s)", snapshot.len());
                self.initial_device_list.store(true, Ordering::Release);
                self.listener.device_list_update(snapshot);
            }
        }
        Ok(())
    }
}
