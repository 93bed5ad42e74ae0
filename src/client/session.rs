//! One attached client process

use super::data::ClientData;
use crate::chunk::dispatch::DispatchCommand;
use crate::chunk::packet::Chunk;
use crate::chunk::registry::ChunkHandler;
use crate::core::types::{ClientKey, DebuggerStatus, DeviceChange};
use crate::engine::Shared;
use crate::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A client: one process on one device, reachable through the dispatch loop
///
/// Sessions hold a weak reference to the engine so that a dropped engine
/// never stays alive through its own device list.
pub struct ClientSession {
    key: ClientKey,
    data: Mutex<ClientData>,
    handshake_complete: AtomicBool,
    dropped: AtomicBool,
    shared: Weak<Shared>,
    #[cfg(test)]
    sent: Mutex<Vec<Chunk>>,
}

impl ClientSession {
    pub(crate) fn new(key: ClientKey, debugger_port: Option<u16>, shared: Weak<Shared>) -> Self {
        let data = ClientData {
            debugger_port,
            debugger_status: if debugger_port.is_some() {
                DebuggerStatus::Default
            } else {
                DebuggerStatus::Error
            },
            ..ClientData::default()
        };
        Self {
            key,
            data: Mutex::new(data),
            handshake_complete: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
            shared,
            #[cfg(test)]
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Session with no engine; sent chunks are recorded
    #[cfg(test)]
    pub(crate) fn detached(key: ClientKey) -> Self {
        let session = Self::new(key, None, Weak::new());
        session.data.lock().debugger_status = DebuggerStatus::Default;
        session.mark_handshake_complete();
        session
    }

    #[cfg(test)]
    pub(crate) fn take_sent(&self) -> Vec<Chunk> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    pub fn serial(&self) -> &str {
        &self.key.serial
    }

    pub fn pid(&self) -> u32 {
        self.key.pid
    }

    /// Lock the telemetry state
    ///
    /// Release the guard before calling anything that may lock it again.
    pub fn data(&self) -> MutexGuard<'_, ClientData> {
        self.data.lock()
    }

    /// Handshake done and not yet dropped
    pub fn is_valid(&self) -> bool {
        self.handshake_complete.load(Ordering::Acquire) && !self.dropped.load(Ordering::Acquire)
    }

    pub fn debugger_port(&self) -> Option<u16> {
        self.data.lock().debugger_port
    }

    /// Distinguishes this session from a later one with the same key
    pub(crate) fn id(&self) -> usize {
        self as *const Self as usize
    }

    pub(crate) fn mark_handshake_complete(&self) {
        self.handshake_complete.store(true, Ordering::Release);
    }

    /// Queue a chunk; replies are routed by tag. Returns the request id.
    pub fn send_chunk(&self, chunk: Chunk) -> Result<u32> {
        self.send(chunk, None)
    }

    /// Queue a chunk whose reply goes to `handler`
    pub fn send_chunk_with_handler(&self, chunk: Chunk, handler: Arc<dyn ChunkHandler>) -> Result<u32> {
        self.send(chunk, Some(handler))
    }

    fn send(&self, chunk: Chunk, owner: Option<Arc<dyn ChunkHandler>>) -> Result<u32> {
        if self.dropped.load(Ordering::Acquire) {
            return Err(Error::ClientClosed(self.key.to_string()));
        }
        match self.shared.upgrade() {
            Some(shared) => shared.dispatch.send(&self.key, &chunk, owner),
            None => self.send_detached(chunk),
        }
    }

    #[cfg(test)]
    fn send_detached(&self, chunk: Chunk) -> Result<u32> {
        let mut sent = self.sent.lock();
        sent.push(chunk);
        Ok(sent.len() as u32)
    }

    #[cfg(not(test))]
    fn send_detached(&self, _chunk: Chunk) -> Result<u32> {
        Err(Error::ClientClosed(self.key.to_string()))
    }

    /// Update the debugger status and report it
    pub(crate) fn set_debugger_status(&self, status: DebuggerStatus) {
        {
            let mut data = self.data.lock();
            if data.debugger_status == status {
                return;
            }
            data.debugger_status = status;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared
                .listeners
                .telemetry(|s| s.debugger_status(self, status));
        }
    }

    /// Reopen on the application's static debugger port, if one is configured
    pub(crate) fn apply_static_port(&self, app_name: &str) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let Some(provider) = &shared.collaborators.debug_ports else {
            return;
        };
        let Some(port) = provider.port_for(self.serial(), app_name) else {
            return;
        };
        if self.debugger_port() != Some(port) {
            log::info!("{}: moving {} to static port {}", self.key, app_name, port);
            shared.tracker.add_client_to_reopen(self.key.clone(), Some(port));
        }
    }

    /// Queue this session to be dropped and recreated
    pub(crate) fn request_reopen(&self, pinned_port: Option<u16>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.tracker.add_client_to_reopen(self.key.clone(), pinned_port);
        }
    }

    /// Tear the session down; later calls do nothing
    ///
    /// Closes the client and debugger sockets, returns the debugger port and
    /// removes the session from its device. With `notify`, device listeners
    /// get a client-list change.
    pub fn drop_session(&self, notify: bool) {
        if self.dropped.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("{}: dropping client", self.key);

        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.dispatch.command(DispatchCommand::Close {
            key: self.key.clone(),
            session: self.id(),
        });

        let port = {
            let mut data = self.data.lock();
            data.debugger_status = DebuggerStatus::Default;
            data.debugger_port.take()
        };
        if let Some(port) = port {
            shared.ports.release(port);
        }

        shared.devices.remove_session(self);
        if notify
            && let Some(info) = shared.devices.info(self.serial())
        {
            shared.listeners.device_changed(&info, DeviceChange::ClientList);
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("key", &self.key)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::types::ChunkType;

    #[test]
    fn test_detached_session_identity() {
        let session = ClientSession::detached(ClientKey::new("emulator-5554", 42));
        assert_eq!(session.serial(), "emulator-5554");
        assert_eq!(session.pid(), 42);
        assert_eq!(session.key().to_string(), "emulator-5554:42");
        assert!(session.is_valid());
    }

    #[test]
    fn test_new_without_port_is_error_status() {
        let session = ClientSession::new(ClientKey::new("a", 1), None, Weak::new());
        assert_eq!(session.data().debugger_status, DebuggerStatus::Error);
        assert!(!session.is_valid());

        let session = ClientSession::new(ClientKey::new("a", 1), Some(8600), Weak::new());
        assert_eq!(session.data().debugger_status, DebuggerStatus::Default);
        assert_eq!(session.debugger_port(), Some(8600));
    }

    #[test]
    fn test_drop_is_idempotent_and_blocks_sends() {
        let session = ClientSession::detached(ClientKey::new("a", 1));
        let tag = ChunkType::from_tag(b"TEST");
        assert!(session.send_chunk(Chunk::empty(tag)).is_ok());

        session.drop_session(true);
        session.drop_session(true);
        assert!(!session.is_valid());
        assert!(matches!(
            session.send_chunk(Chunk::empty(tag)),
            Err(Error::ClientClosed(_))
        ));
        assert_eq!(session.take_sent().len(), 1);
    }
}
