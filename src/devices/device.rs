//! Device records and the shared device list

use super::reconcile::{DeviceSnapshot, ReconciliationResult, reconcile};
use crate::adb::emulator;
use crate::client::ClientSession;
use crate::core::types::{ClientKey, DeviceState};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of a device handed to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: String,
    pub state: DeviceState,
    /// AVD name for emulators
    pub name: Option<String>,
}

impl DeviceInfo {
    pub fn is_online(&self) -> bool {
        self.state.is_online()
    }

    pub fn is_emulator(&self) -> bool {
        emulator::is_emulator(&self.serial)
    }
}

/// Tracking socket handle tagged with the generation it was stored under
struct MonitorSocket {
    generation: u64,
    stream: TcpStream,
}

/// A device known to the engine
pub struct DeviceRecord {
    serial: String,
    state: DeviceState,
    name: Option<String>,
    /// Handle on the tracking socket, set only while tracking is active
    monitor_socket: Option<MonitorSocket>,
    clients: HashMap<u32, Arc<ClientSession>>,
    /// Sessions connected but still waiting for the handshake echo
    handshaking: HashMap<u32, Arc<ClientSession>>,
}

impl DeviceRecord {
    fn new(serial: String, state: DeviceState) -> Self {
        Self {
            serial,
            state,
            name: None,
            monitor_socket: None,
            clients: HashMap::new(),
            handshaking: HashMap::new(),
        }
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            serial: self.serial.clone(),
            state: self.state,
            name: self.name.clone(),
        }
    }

    /// Close the tracking socket and hand back every session, handshaking ones included
    fn close(mut self) -> (DeviceInfo, Vec<Arc<ClientSession>>) {
        if let Some(socket) = self.monitor_socket.take() {
            let _ = socket.stream.shutdown(Shutdown::Both);
        }
        let info = self.info();
        let sessions = self
            .clients
            .into_values()
            .chain(self.handshaking.into_values())
            .collect();
        (info, sessions)
    }

    fn has_pid(&self, pid: u32) -> bool {
        self.clients.contains_key(&pid) || self.handshaking.contains_key(&pid)
    }
}

/// Changes performed by [`DeviceList::apply`]
///
/// Sessions of removed devices are returned rather than dropped so the
/// caller can tear them down without holding the list lock.
#[derive(Default)]
pub struct AppliedChanges {
    pub disconnected: Vec<(DeviceInfo, Vec<Arc<ClientSession>>)>,
    pub changed: Vec<DeviceInfo>,
    pub connected: Vec<DeviceInfo>,
    /// Serials that became online through this update
    pub newly_online: Vec<String>,
}

/// All devices known to the engine, keyed by serial
#[derive(Default)]
pub struct DeviceList {
    devices: Mutex<HashMap<String, DeviceRecord>>,
    monitor_generation: AtomicU64,
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile against `snapshot` and apply the result atomically
    pub fn update(&self, snapshot: &DeviceSnapshot) -> AppliedChanges {
        let mut devices = self.devices.lock();
        let result = reconcile(
            devices.values().map(|d| (d.serial.as_str(), d.state)),
            snapshot,
        );
        Self::apply_locked(&mut devices, result)
    }

    /// Apply a precomputed reconciliation result
    pub fn apply(&self, result: ReconciliationResult) -> AppliedChanges {
        let mut devices = self.devices.lock();
        Self::apply_locked(&mut devices, result)
    }

    fn apply_locked(
        devices: &mut HashMap<String, DeviceRecord>,
        result: ReconciliationResult,
    ) -> AppliedChanges {
        let mut changes = AppliedChanges::default();

        for serial in result.removed {
            if let Some(record) = devices.remove(&serial) {
                changes.disconnected.push(record.close());
            }
        }

        for (serial, state) in result.updated {
            if let Some(record) = devices.get_mut(&serial) {
                let was_online = record.state.is_online();
                record.state = state;
                if state.is_online() && !was_online {
                    changes.newly_online.push(serial.clone());
                }
                changes.changed.push(record.info());
            }
        }

        for (serial, state) in result.added {
            let record = DeviceRecord::new(serial.clone(), state);
            changes.connected.push(record.info());
            if state.is_online() {
                changes.newly_online.push(serial.clone());
            }
            devices.insert(serial, record);
        }

        changes
    }

    /// Remove every device, as after losing the daemon connection
    pub fn remove_all(&self) -> Vec<(DeviceInfo, Vec<Arc<ClientSession>>)> {
        let mut devices = self.devices.lock();
        devices.drain().map(|(_, record)| record.close()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    pub fn infos(&self) -> Vec<DeviceInfo> {
        let mut infos: Vec<DeviceInfo> = self.devices.lock().values().map(DeviceRecord::info).collect();
        infos.sort_by(|a, b| a.serial.cmp(&b.serial));
        infos
    }

    pub fn info(&self, serial: &str) -> Option<DeviceInfo> {
        self.devices.lock().get(serial).map(DeviceRecord::info)
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.devices.lock().contains_key(serial)
    }

    pub fn is_online(&self, serial: &str) -> bool {
        self.devices
            .lock()
            .get(serial)
            .is_some_and(|d| d.state.is_online())
    }

    /// Store the emulator name; returns the updated view when it changed
    pub fn set_name(&self, serial: &str, name: String) -> Option<DeviceInfo> {
        let mut devices = self.devices.lock();
        let record = devices.get_mut(serial)?;
        if record.name.as_deref() == Some(name.as_str()) {
            return None;
        }
        record.name = Some(name);
        Some(record.info())
    }

    pub fn is_tracking(&self, serial: &str) -> bool {
        self.devices
            .lock()
            .get(serial)
            .is_some_and(|d| d.monitor_socket.is_some())
    }

    /// Mark tracking active and return the socket's generation
    ///
    /// Fails if the device is gone or already tracked.
    pub fn set_monitor_socket(&self, serial: &str, socket: TcpStream) -> Option<u64> {
        let mut devices = self.devices.lock();
        let record = devices.get_mut(serial)?;
        if record.monitor_socket.is_some() {
            return None;
        }
        let generation = self.monitor_generation.fetch_add(1, Ordering::Relaxed) + 1;
        record.monitor_socket = Some(MonitorSocket {
            generation,
            stream: socket,
        });
        Some(generation)
    }

    /// Mark tracking inactive if the stored socket is still `generation`
    pub fn clear_monitor_socket(&self, serial: &str, generation: u64) -> bool {
        let mut devices = self.devices.lock();
        let Some(record) = devices.get_mut(serial) else {
            return false;
        };
        if record
            .monitor_socket
            .as_ref()
            .is_some_and(|s| s.generation == generation)
        {
            record.monitor_socket = None;
            true
        } else {
            false
        }
    }

    /// Pids of sessions that completed their handshake
    pub fn client_pids(&self, serial: &str) -> Option<HashSet<u32>> {
        self.devices
            .lock()
            .get(serial)
            .map(|d| d.clients.keys().copied().collect())
    }

    /// Pids with a session in any state, handshaking included
    pub fn known_pids(&self, serial: &str) -> Option<HashSet<u32>> {
        self.devices.lock().get(serial).map(|d| {
            d.clients
                .keys()
                .chain(d.handshaking.keys())
                .copied()
                .collect()
        })
    }

    /// Register a session with its device; fails on duplicates
    pub fn add_client(&self, session: Arc<ClientSession>) -> bool {
        let mut devices = self.devices.lock();
        let pid = session.pid();
        match devices.get_mut(session.serial()) {
            Some(record) if !record.has_pid(pid) => {
                record.clients.insert(pid, session);
                true
            }
            _ => false,
        }
    }

    /// Park a session whose handshake is in flight; fails on duplicates
    pub fn add_handshaking(&self, session: Arc<ClientSession>) -> bool {
        let mut devices = self.devices.lock();
        let pid = session.pid();
        match devices.get_mut(session.serial()) {
            Some(record) if !record.has_pid(pid) => {
                record.handshaking.insert(pid, session);
                true
            }
            _ => false,
        }
    }

    /// Move a parked session to the client set
    ///
    /// Fails when the session was removed or replaced in the meantime.
    pub fn complete_handshake(&self, session: &ClientSession) -> bool {
        let mut devices = self.devices.lock();
        let Some(record) = devices.get_mut(session.serial()) else {
            return false;
        };
        let pid = session.pid();
        if !record
            .handshaking
            .get(&pid)
            .is_some_and(|c| c.id() == session.id())
        {
            return false;
        }
        if let Some(parked) = record.handshaking.remove(&pid) {
            record.clients.insert(pid, parked);
        }
        true
    }

    pub fn remove_client(&self, key: &ClientKey) -> Option<Arc<ClientSession>> {
        self.devices
            .lock()
            .get_mut(&key.serial)
            .and_then(|d| d.clients.remove(&key.pid))
    }

    /// Remove `session` unless a newer session has taken its key
    pub fn remove_session(&self, session: &ClientSession) -> bool {
        let mut devices = self.devices.lock();
        let Some(record) = devices.get_mut(session.serial()) else {
            return false;
        };
        let pid = session.pid();
        for sessions in [&mut record.clients, &mut record.handshaking] {
            if sessions.get(&pid).is_some_and(|c| c.id() == session.id()) {
                sessions.remove(&pid);
                return true;
            }
        }
        false
    }

    pub fn client(&self, key: &ClientKey) -> Option<Arc<ClientSession>> {
        self.devices
            .lock()
            .get(&key.serial)
            .and_then(|d| d.clients.get(&key.pid).cloned())
    }

    /// Like [`client`](Self::client), but also finds a session still handshaking
    pub fn any_session(&self, key: &ClientKey) -> Option<Arc<ClientSession>> {
        self.devices.lock().get(&key.serial).and_then(|d| {
            d.clients
                .get(&key.pid)
                .or_else(|| d.handshaking.get(&key.pid))
                .cloned()
        })
    }

    pub fn clients(&self, serial: &str) -> Vec<Arc<ClientSession>> {
        let mut clients: Vec<Arc<ClientSession>> = self
            .devices
            .lock()
            .get(serial)
            .map(|d| d.clients.values().cloned().collect())
            .unwrap_or_default();
        clients.sort_by_key(|c| c.pid());
        clients
    }
}
