//! Client-list tracker
//!
//! One lazily started thread watches the `track-jdwp` socket of every online
//! device with `mio`. Each frame is a full pid list; the difference against
//! the device's sessions decides which clients are dropped and opened.
//! The same thread services drop-and-reopen requests. Opening a client only
//! connects and sends the handshake; the echo is awaited by the dispatch loop.

use super::pids::{diff_pids, parse_pid_list};
use crate::adb::framing::FrameBuffer;
use crate::adb::protocol;
use crate::client::ClientSession;
use crate::client::handshake;
use crate::chunk::dispatch::DispatchCommand;
use crate::core::types::{ClientKey, DeviceChange};
use crate::engine::Shared;
use crate::error::{Error, Result};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{ErrorKind, Read};
use std::net::Shutdown;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const WAKER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

struct PendingSocket {
    serial: String,
    generation: u64,
    stream: TcpStream,
}

/// Shared side of the tracker thread
#[derive(Default)]
pub struct TrackerHandle {
    /// Clients to drop and recreate, with an optional pinned port
    reopen: Mutex<HashMap<ClientKey, Option<u16>>>,
    /// New tracking sockets waiting for registration
    pending: Mutex<VecDeque<PendingSocket>>,
    waker: OnceLock<Waker>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TrackerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a client for drop-and-reopen; a later request for the same client wins
    pub fn add_client_to_reopen(&self, key: ClientKey, pinned_port: Option<u16>) {
        log::debug!("{}: queued for reopen (port {:?})", key, pinned_port);
        self.reopen.lock().insert(key, pinned_port);
        self.wake();
    }

    pub fn pending_reopen(&self) -> usize {
        self.reopen.lock().len()
    }

    pub fn wake(&self) {
        if let Some(waker) = self.waker.get()
            && let Err(e) = waker.wake()
        {
            log::warn!("Failed to wake client tracker: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Spawn the tracker thread on first use
    pub(crate) fn ensure_started(&self, shared: &Arc<Shared>) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        if self.waker.set(waker).is_err() {
            return Err(Error::Other("client tracker already ran".to_string()));
        }

        let mut tracker = ClientTracker::new(Arc::clone(shared), poll);
        let handle = thread::Builder::new()
            .name("client-tracker".to_string())
            .spawn(move || {
                if let Err(e) = tracker.run() {
                    log::error!("Client tracker error: {}", e);
                }
            })
            .map_err(|e| Error::ThreadSpawn(format!("client-tracker: {}", e)))?;
        *thread = Some(handle);
        Ok(())
    }

    pub(crate) fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            self.wake();
            if handle.join().is_err() {
                log::error!("Client tracker thread panicked");
            }
        }
    }
}

/// Open the `track-jdwp` socket of a device and hand it to the tracker
///
/// Does nothing when client support is disabled or the device is already tracked.
pub(crate) fn start_monitoring_device(shared: &Arc<Shared>, serial: &str) -> Result<()> {
    if !shared.config.clients.enabled || shared.devices.is_tracking(serial) {
        return Ok(());
    }

    let stream = protocol::open_jdwp_tracker(&shared.config.bridge, serial)?;
    stream.set_read_timeout(None)?;
    stream.set_nonblocking(true)?;

    let handle = stream.try_clone()?;
    let Some(generation) = shared.devices.set_monitor_socket(serial, handle) else {
        log::debug!("{}: already tracked or gone", serial);
        let _ = stream.shutdown(Shutdown::Both);
        return Ok(());
    };

    if let Err(e) = shared.tracker.ensure_started(shared) {
        shared.devices.clear_monitor_socket(serial, generation);
        return Err(e);
    }

    log::info!("{}: tracking clients", serial);
    shared.tracker.pending.lock().push_back(PendingSocket {
        serial: serial.to_string(),
        generation,
        stream: TcpStream::from_std(stream),
    });
    shared.tracker.wake();
    Ok(())
}

/// Connect to one process, send the handshake and hand the socket to dispatch
///
/// The session stays parked on its device until the dispatch loop reads the
/// echo. A pinned port already on loan falls back to the pool. With no port
/// left the session is still created, with its debugger status set to error.
pub(crate) fn open_client(
    shared: &Arc<Shared>,
    serial: &str,
    pid: u32,
    pinned_port: Option<u16>,
) -> Result<()> {
    let key = ClientKey::new(serial, pid);
    let mut stream = protocol::open_pass_through(&shared.config.bridge, serial, pid)?;
    handshake::send(&mut stream)?;
    stream.set_read_timeout(None)?;
    stream.set_nonblocking(true)?;

    let port = match pinned_port {
        Some(port) if shared.ports.claim(port) => Some(port),
        Some(port) => {
            log::warn!("{}: pinned port {} in use", key, port);
            shared.ports.allocate()
        }
        None => shared.ports.allocate(),
    };
    if port.is_none() {
        log::error!("{}: {}", key, Error::NoDebuggerPort);
    }

    let session = Arc::new(ClientSession::new(key, port, Arc::downgrade(shared)));
    if !shared.devices.add_handshaking(Arc::clone(&session)) {
        session.drop_session(false);
        return Err(Error::Other(format!("{} already has a session", session.key())));
    }
    shared.dispatch.command(DispatchCommand::Register {
        session: Arc::clone(&session),
        stream: TcpStream::from_std(stream),
    });
    log::debug!("{}: handshake sent (debugger port {:?})", session.key(), port);
    Ok(())
}

struct Tracked {
    serial: String,
    generation: u64,
    stream: TcpStream,
    frames: FrameBuffer,
}

/// State owned by the `client-tracker` thread
struct ClientTracker {
    shared: Arc<Shared>,
    poll: Poll,
    sockets: HashMap<Token, Tracked>,
    next_token: usize,
    /// Consecutive tracking failures per device
    retrack_attempts: HashMap<String, u32>,
    read_buf: Vec<u8>,
}

impl ClientTracker {
    fn new(shared: Arc<Shared>, poll: Poll) -> Self {
        Self {
            shared,
            poll,
            sockets: HashMap::new(),
            next_token: 1,
            retrack_attempts: HashMap::new(),
            read_buf: vec![0; 4096],
        }
    }

    fn run(&mut self) -> Result<()> {
        log::info!("Client tracker started");
        let mut events = Events::with_capacity(64);

        while !self.shared.is_shutting_down() {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Io(e));
            }
            if self.shared.is_shutting_down() {
                break;
            }

            self.process_reopen();
            self.register_pending();

            let ready: Vec<Token> = events
                .iter()
                .map(|e| e.token())
                .filter(|t| *t != WAKER)
                .collect();
            for token in ready {
                self.read_socket(token);
            }
        }

        for (_, mut tracked) in self.sockets.drain() {
            let _ = self.poll.registry().deregister(&mut tracked.stream);
            let _ = tracked.stream.shutdown(Shutdown::Both);
        }
        log::info!("Client tracker stopped");
        Ok(())
    }

    fn process_reopen(&mut self) {
        let requests: Vec<(ClientKey, Option<u16>)> =
            self.shared.tracker.reopen.lock().drain().collect();

        for (key, pinned_port) in requests {
            let Some(session) = self.shared.devices.any_session(&key) else {
                log::debug!("{}: reopen skipped, client gone", key);
                continue;
            };
            let before = self.shared.devices.client_pids(&key.serial);
            session.drop_session(false);
            thread::sleep(self.shared.config.clients.reopen_delay());

            if self.shared.devices.is_online(&key.serial)
                && let Err(e) = open_client(&self.shared, &key.serial, key.pid, pinned_port)
            {
                log::warn!("{}: reopen failed: {}", key, e);
            }
            self.notify_if_changed(&key.serial, before);
        }
    }

    fn register_pending(&mut self) {
        let pending: Vec<PendingSocket> = self.shared.tracker.pending.lock().drain(..).collect();

        for PendingSocket {
            serial,
            generation,
            mut stream,
        } in pending
        {
            let token = Token(self.next_token);
            self.next_token += 1;
            if let Err(e) = self
                .poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
            {
                log::error!("{}: cannot register tracking socket: {}", serial, e);
                self.shared.devices.clear_monitor_socket(&serial, generation);
                continue;
            }
            self.sockets.insert(
                token,
                Tracked {
                    serial,
                    generation,
                    stream,
                    frames: FrameBuffer::new(),
                },
            );
            // The first pid list may already be buffered
            self.read_socket(token);
        }
    }

    fn read_socket(&mut self, token: Token) {
        let Some(tracked) = self.sockets.get_mut(&token) else {
            return;
        };

        let mut result = Ok(());
        loop {
            match tracked.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    result = Err(Error::ConnectionClosed);
                    break;
                }
                Ok(n) => tracked.frames.extend(&self.read_buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    result = Err(Error::Io(e));
                    break;
                }
            }
        }

        let mut frames = Vec::new();
        loop {
            match tracked.frames.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        let serial = tracked.serial.clone();

        for frame in frames {
            self.retrack_attempts.remove(&serial);
            self.apply_pid_list(&serial, &frame);
        }

        if let Err(e) = result {
            self.tracking_failed(token, e);
        }
    }

    fn apply_pid_list(&self, serial: &str, frame: &[u8]) {
        let next = parse_pid_list(frame);
        let Some(current) = self.shared.devices.known_pids(serial) else {
            return;
        };
        let diff = diff_pids(&current, &next);
        if diff.is_empty() {
            return;
        }
        let before = self.shared.devices.client_pids(serial);
        log::debug!(
            "{}: clients -{:?} +{:?}",
            serial,
            diff.removed,
            diff.added
        );

        for pid in diff.removed {
            if let Some(session) = self.shared.devices.any_session(&ClientKey::new(serial, pid)) {
                session.drop_session(false);
            }
        }
        for pid in diff.added {
            if let Err(e) = open_client(&self.shared, serial, pid, None) {
                log::warn!("{}:{}: cannot open client: {}", serial, pid, e);
            }
        }
        self.notify_if_changed(serial, before);
    }

    /// Report a client-list change if the established pids differ from `before`
    ///
    /// Clients that finish their handshake later are reported by the dispatch loop.
    fn notify_if_changed(&self, serial: &str, before: Option<HashSet<u32>>) {
        if self.shared.devices.client_pids(serial) == before {
            return;
        }
        if let Some(info) = self.shared.devices.info(serial) {
            self.shared
                .listeners
                .device_changed(&info, DeviceChange::ClientList);
        }
    }

    /// Close a failed tracking socket and retrack while the device stays online
    fn tracking_failed(&mut self, token: Token, error: Error) {
        let Some(mut tracked) = self.sockets.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut tracked.stream);
        let _ = tracked.stream.shutdown(Shutdown::Both);
        if !self
            .shared
            .devices
            .clear_monitor_socket(&tracked.serial, tracked.generation)
        {
            log::debug!("{}: stale tracking socket closed: {}", tracked.serial, error);
            return;
        }

        if self.shared.is_shutting_down() || !self.shared.devices.is_online(&tracked.serial) {
            log::debug!("{}: tracking ended: {}", tracked.serial, error);
            self.retrack_attempts.remove(&tracked.serial);
            return;
        }

        let attempts = self
            .retrack_attempts
            .entry(tracked.serial.clone())
            .or_insert(0);
        *attempts += 1;
        if *attempts > self.shared.config.clients.max_retrack_attempts {
            log::error!(
                "{}: giving up tracking after {} failures: {}",
                tracked.serial,
                attempts,
                error
            );
            return;
        }

        log::warn!(
            "{}: tracking failed ({}), retrying (attempt {})",
            tracked.serial,
            error,
            attempts
        );
        if let Err(e) = start_monitoring_device(&self.shared, &tracked.serial) {
            log::error!("{}: retrack failed: {}", tracked.serial, e);
        }
    }
}
