//! Engine lifecycle and the state shared by its threads
//!
//! The engine runs three kinds of threads:
//!
//! - `device-monitor`: blocking `host:track-devices` subscription
//! - `client-tracker`: started with the first online device, watches pid lists
//! - `ddm-dispatch`: readiness loop over every client and debugger socket
//!
//! All of them reach the device list, the handler registry and the listeners
//! through one [`Shared`] value.

use crate::chunk::dispatch::{DispatchHandle, DispatchLoop};
use crate::chunk::registry::HandlerRegistry;
use crate::client::{ClientSession, DebuggerPortPool};
use crate::config::Config;
use crate::core::listener::{Collaborators, Listeners};
use crate::core::types::ClientKey;
use crate::devices::updater::DeviceUpdater;
use crate::devices::{DeviceInfo, DeviceList, DeviceMonitor};
use crate::error::{Error, Result};
use crate::tracking::TrackerHandle;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// State reachable from every engine thread
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) listeners: Listeners,
    pub(crate) collaborators: Collaborators,
    pub(crate) devices: DeviceList,
    pub(crate) ports: DebuggerPortPool,
    pub(crate) registry: HandlerRegistry,
    pub(crate) dispatch: DispatchHandle,
    pub(crate) tracker: TrackerHandle,
    shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// State with no threads behind it
    #[cfg(test)]
    pub(crate) fn for_tests(config: Config, listeners: Listeners) -> Arc<Self> {
        Arc::new(Self {
            registry: HandlerRegistry::with_default_handlers(&listeners),
            ports: DebuggerPortPool::new(
                config.clients.debugger_port_base,
                config.clients.debugger_port_count,
            ),
            config,
            listeners,
            collaborators: Collaborators::default(),
            devices: DeviceList::new(),
            dispatch: DispatchHandle::new(),
            tracker: TrackerHandle::new(),
            shutdown: AtomicBool::new(false),
        })
    }
}

/// Device and client monitoring engine
///
/// # Example
/// ```no_run
/// use ddm_bridge::config::Config;
/// use ddm_bridge::core::{Collaborators, Listeners};
/// use ddm_bridge::Engine;
///
/// let mut engine = Engine::new(Config::default(), Listeners::default(), Collaborators::default())?;
/// engine.start()?;
/// for device in engine.devices() {
///     println!("{} {:?}", device.serial, device.state);
/// }
/// engine.stop();
/// # Ok::<(), ddm_bridge::Error>(())
/// ```
pub struct Engine {
    shared: Arc<Shared>,
    monitor: Arc<DeviceMonitor>,
    threads: Vec<JoinHandle<()>>,
    started: bool,
    stopped: bool,
}

impl Engine {
    pub fn new(config: Config, listeners: Listeners, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let registry = HandlerRegistry::with_default_handlers(&listeners);
        let ports = DebuggerPortPool::new(
            config.clients.debugger_port_base,
            config.clients.debugger_port_count,
        );
        let launcher = collaborators.launcher.clone();
        let shared = Arc::new(Shared {
            config,
            listeners,
            collaborators,
            devices: DeviceList::new(),
            ports,
            registry,
            dispatch: DispatchHandle::new(),
            tracker: TrackerHandle::new(),
            shutdown: AtomicBool::new(false),
        });

        let updater = Arc::new(DeviceUpdater::new(Arc::clone(&shared)));
        let monitor = Arc::new(DeviceMonitor::new(
            shared.config.bridge.clone(),
            shared.config.discovery.clone(),
            launcher,
            updater,
        ));

        Ok(Self {
            shared,
            monitor,
            threads: Vec::new(),
            started: false,
            stopped: false,
        })
    }

    /// Spawn the dispatch and device monitor threads
    pub fn start(&mut self) -> Result<()> {
        if self.stopped {
            return Err(Error::Other("engine was stopped".to_string()));
        }
        if self.started {
            return Ok(());
        }

        let mut dispatch = DispatchLoop::new(Arc::clone(&self.shared))?;
        let handle = thread::Builder::new()
            .name("ddm-dispatch".to_string())
            .spawn(move || {
                if let Err(e) = dispatch.run() {
                    log::error!("Dispatch loop error: {}", e);
                }
            })
            .map_err(|e| Error::ThreadSpawn(format!("ddm-dispatch: {}", e)))?;
        self.threads.push(handle);

        let monitor = Arc::clone(&self.monitor);
        let handle = thread::Builder::new()
            .name("device-monitor".to_string())
            .spawn(move || monitor.run())
            .map_err(|e| Error::ThreadSpawn(format!("device-monitor: {}", e)))?;
        self.threads.push(handle);

        self.started = true;
        log::info!("Engine started");
        Ok(())
    }

    /// Stop every thread and drop every client; later calls do nothing
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        log::info!("Stopping engine");

        self.shared.shutdown.store(true, Ordering::Release);
        self.monitor.stop();
        self.shared.dispatch.wake();
        self.shared.tracker.wake();

        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("engine").to_string();
            if handle.join().is_err() {
                log::error!("{} thread panicked", name);
            }
        }
        self.shared.tracker.join();

        for (_, sessions) in self.shared.devices.remove_all() {
            for session in sessions {
                session.drop_session(false);
            }
        }
        log::info!("Engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started && !self.stopped
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Known devices, sorted by serial
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.shared.devices.infos()
    }

    pub fn device(&self, serial: &str) -> Option<DeviceInfo> {
        self.shared.devices.info(serial)
    }

    /// Sessions of one device, sorted by pid
    pub fn clients(&self, serial: &str) -> Vec<Arc<ClientSession>> {
        self.shared.devices.clients(serial)
    }

    pub fn client(&self, serial: &str, pid: u32) -> Option<Arc<ClientSession>> {
        self.shared.devices.client(&ClientKey::new(serial, pid))
    }

    /// Drop `client` and reconnect it, optionally on a fixed debugger port
    pub fn add_client_to_reopen(&self, client: &ClientSession, pinned_port: Option<u16>) {
        self.shared
            .tracker
            .add_client_to_reopen(client.key().clone(), pinned_port);
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_monitoring()
    }

    pub fn connection_attempt_count(&self) -> u32 {
        self.monitor.connection_attempt_count()
    }

    pub fn restart_attempt_count(&self) -> u32 {
        self.monitor.restart_attempt_count()
    }

    pub fn has_initial_device_list(&self) -> bool {
        self.monitor.has_initial_device_list()
    }

    /// Debugger ports not on loan
    pub fn available_debugger_ports(&self) -> usize {
        self.shared.ports.available()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}
