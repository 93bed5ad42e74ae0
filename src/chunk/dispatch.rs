//! Shared dispatch loop for every client session
//!
//! One thread multiplexes all client sockets, their debugger listening
//! sockets and any attached debuggers with `mio`.
//!
//! # Message Flow
//!
//! ```text
//! ClientSession::send_chunk ──► DispatchCommand::Send ──► channel + Waker
//!                                                              │
//!                                   ┌──────────────────────────┘
//!                                   ▼
//!                           ddm-dispatch thread
//!                 ┌─────────────────┼──────────────────┐
//!                 ▼                 ▼                  ▼
//!           client socket    debugger listener    debugger socket
//!           (DDM chunks)     (one at a time)      (relayed packets)
//! ```
//!
//! A client socket arrives with our handshake already sent. Its connection
//! stays handshake-pending until the echo is read; only then does the session
//! join its device and the handlers see it. A peer that never answers is
//! dropped at its deadline.
//!
//! Replies are matched to requests by packet id. A matched reply goes to the
//! handler that owns the request, which may differ from the reply's tag.

use super::packet::{Chunk, JdwpPacket, PacketReader};
use super::registry::ChunkHandler;
use super::types::ChunkType;
use crate::client::ClientSession;
use crate::client::handshake::{HANDSHAKE, HANDSHAKE_LEN, HandshakeStatus, check_handshake};
use crate::core::types::{ClientKey, DebuggerStatus, DeviceChange};
use crate::engine::Shared;
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// First id used for packets sent by the engine
pub const FIRST_REQUEST_ID: u32 = 0x4000_0000;

const WAKER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const READ_CHUNK: usize = 64 * 1024;

/// Work handed to the dispatch thread
pub enum DispatchCommand {
    /// Start multiplexing a client socket whose handshake was sent
    Register {
        session: Arc<ClientSession>,
        stream: TcpStream,
    },
    /// Write an encoded DDM packet
    Send {
        key: ClientKey,
        id: u32,
        kind: ChunkType,
        packet: Vec<u8>,
        owner: Option<Arc<dyn ChunkHandler>>,
    },
    /// Close the sockets of one session
    Close { key: ClientKey, session: usize },
}

/// Sending side of the dispatch loop, shared by every session
pub struct DispatchHandle {
    sender: Sender<DispatchCommand>,
    receiver: Receiver<DispatchCommand>,
    waker: OnceLock<Waker>,
    next_id: AtomicU32,
}

impl DispatchHandle {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            waker: OnceLock::new(),
            next_id: AtomicU32::new(FIRST_REQUEST_ID),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Frame `chunk` as a DDM command and queue it; returns the packet id
    pub fn send(
        &self,
        key: &ClientKey,
        chunk: &Chunk,
        owner: Option<Arc<dyn ChunkHandler>>,
    ) -> Result<u32> {
        let id = self.next_id();
        log::trace!("{}: queue {} id {:#x}", key, chunk.kind, id);
        self.sender
            .send(DispatchCommand::Send {
                key: key.clone(),
                id,
                kind: chunk.kind,
                packet: JdwpPacket::ddm_command(id, chunk).encode(),
                owner,
            })
            .map_err(|_| Error::ClientClosed(key.to_string()))?;
        self.wake();
        Ok(id)
    }

    pub fn command(&self, command: DispatchCommand) {
        if self.sender.send(command).is_err() {
            log::debug!("Dispatch channel closed");
            return;
        }
        self.wake();
    }

    pub fn wake(&self) {
        if let Some(waker) = self.waker.get()
            && let Err(e) = waker.wake()
        {
            log::warn!("Failed to wake dispatch loop: {}", e);
        }
    }

    fn set_waker(&self, waker: Waker) -> Result<()> {
        self.waker
            .set(waker)
            .map_err(|_| Error::Other("dispatch loop already running".to_string()))
    }
}

impl Default for DispatchHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A socket with read reassembly and a write backlog
struct Channel {
    stream: TcpStream,
    token: Token,
    reader: PacketReader,
    outbound: Vec<u8>,
    wants_write: bool,
}

impl Channel {
    fn new(stream: TcpStream, token: Token) -> Self {
        Self {
            stream,
            token,
            reader: PacketReader::new(),
            outbound: Vec::new(),
            wants_write: false,
        }
    }

    /// Read until the socket would block
    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => self.reader.extend(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn queue(&mut self, registry: &Registry, data: &[u8]) -> Result<()> {
        self.outbound.extend_from_slice(data);
        self.flush(registry)
    }

    /// Write as much backlog as the socket takes, asking for writability if any remains
    fn flush(&mut self, registry: &Registry) -> Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let wants_write = !self.outbound.is_empty();
        if wants_write != self.wants_write {
            let interest = if wants_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            registry.reregister(&mut self.stream, self.token, interest)?;
            self.wants_write = wants_write;
        }
        Ok(())
    }

    fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

struct Debugger {
    channel: Channel,
    handshake_done: bool,
}

struct Pending {
    kind: ChunkType,
    owner: Option<Arc<dyn ChunkHandler>>,
}

struct Connection {
    session: Arc<ClientSession>,
    client: Channel,
    pending: HashMap<u32, Pending>,
    listener: Option<(TcpListener, Token)>,
    debugger: Option<Debugger>,
    /// Set until the client echoes the handshake
    handshake_deadline: Option<Instant>,
}

impl Connection {
    fn close(&mut self, registry: &Registry) {
        self.client.close(registry);
        if let Some((mut listener, _)) = self.listener.take() {
            let _ = registry.deregister(&mut listener);
        }
        if let Some(mut debugger) = self.debugger.take() {
            debugger.channel.close(registry);
        }
        self.pending.clear();
    }
}

#[derive(Debug, Clone)]
enum Endpoint {
    Client(ClientKey),
    Listener(ClientKey),
    Debugger(ClientKey),
}

/// State owned by the `ddm-dispatch` thread
pub(crate) struct DispatchLoop {
    shared: Arc<Shared>,
    poll: Poll,
    commands: Receiver<DispatchCommand>,
    connections: HashMap<ClientKey, Connection>,
    endpoints: HashMap<Token, Endpoint>,
    next_token: usize,
    read_buf: Vec<u8>,
}

impl DispatchLoop {
    pub(crate) fn new(shared: Arc<Shared>) -> Result<Self> {
        let poll = Poll::new()?;
        shared
            .dispatch
            .set_waker(Waker::new(poll.registry(), WAKER)?)?;
        let commands = shared.dispatch.receiver.clone();
        Ok(Self {
            shared,
            poll,
            commands,
            connections: HashMap::new(),
            endpoints: HashMap::new(),
            next_token: 1,
            read_buf: vec![0; READ_CHUNK],
        })
    }

    pub(crate) fn run(&mut self) -> Result<()> {
        log::info!("Dispatch loop started");
        let mut events = Events::with_capacity(256);

        while !self.shared.is_shutting_down() {
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Io(e));
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER {
                    continue;
                }
                let Some(endpoint) = self.endpoints.get(&token).cloned() else {
                    continue;
                };
                match endpoint {
                    Endpoint::Client(key) => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.on_client_readable(&key);
                        }
                        if event.is_writable() {
                            self.on_client_writable(&key);
                        }
                    }
                    Endpoint::Listener(key) => self.accept_debugger(&key),
                    Endpoint::Debugger(key) => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.on_debugger_readable(&key);
                        }
                        if event.is_writable() {
                            self.on_debugger_writable(&key);
                        }
                    }
                }
            }

            self.drain_commands();
            self.expire_handshakes();
        }

        let registry = self.poll.registry();
        for (_, mut connection) in self.connections.drain() {
            connection.close(registry);
        }
        log::info!("Dispatch loop stopped");
        Ok(())
    }

    /// Wake in time for the nearest handshake deadline
    fn poll_timeout(&self) -> Duration {
        let now = Instant::now();
        self.connections
            .values()
            .filter_map(|c| c.handshake_deadline)
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(POLL_TIMEOUT, Duration::min)
    }

    fn expire_handshakes(&mut self) {
        let now = Instant::now();
        let expired: Vec<ClientKey> = self
            .connections
            .iter()
            .filter(|(_, c)| c.handshake_deadline.is_some_and(|d| d <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.close_connection(&key, Error::Timeout);
        }
    }

    fn drain_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn allocate_token(&mut self, endpoint: Endpoint) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.endpoints.insert(token, endpoint);
        token
    }

    fn handle_command(&mut self, command: DispatchCommand) {
        match command {
            DispatchCommand::Register { session, stream } => self.register(session, stream),
            DispatchCommand::Send {
                key,
                id,
                kind,
                packet,
                owner,
            } => {
                let registry = self.poll.registry();
                let Some(connection) = self.connections.get_mut(&key) else {
                    log::debug!("{}: dropping {} for unknown client", key, kind);
                    return;
                };
                connection.pending.insert(id, Pending { kind, owner });
                if let Err(e) = connection.client.queue(registry, &packet) {
                    self.close_connection(&key, e);
                }
            }
            DispatchCommand::Close { key, session } => {
                let matches = self
                    .connections
                    .get(&key)
                    .is_some_and(|c| c.session.id() == session);
                if matches {
                    self.remove_connection(&key);
                }
            }
        }
    }

    fn register(&mut self, session: Arc<ClientSession>, mut stream: TcpStream) {
        let key = session.key().clone();
        if self.connections.contains_key(&key) {
            log::warn!("{}: replacing existing connection", key);
            self.remove_connection(&key);
        }

        let token = self.allocate_token(Endpoint::Client(key.clone()));
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            log::error!("{}: failed to register socket: {}", key, e);
            self.endpoints.remove(&token);
            session.drop_session(false);
            return;
        }

        let deadline = Instant::now() + self.shared.config.clients.handshake_timeout();
        self.connections.insert(
            key.clone(),
            Connection {
                session,
                client: Channel::new(stream, token),
                pending: HashMap::new(),
                listener: None,
                debugger: None,
                handshake_deadline: Some(deadline),
            },
        );
        log::debug!("{}: awaiting handshake", key);

        // Edge-triggered: bytes that arrived before registration raise no event
        self.on_client_readable(&key);
    }

    fn on_client_readable(&mut self, key: &ClientKey) {
        let Some(connection) = self.connections.get_mut(key) else {
            return;
        };
        let read = connection.client.fill(&mut self.read_buf);

        if connection.handshake_deadline.is_some() {
            match check_handshake(connection.client.reader.buffered()) {
                HandshakeStatus::Good => {
                    connection.client.reader.take_prefix(HANDSHAKE_LEN);
                    connection.handshake_deadline = None;
                }
                HandshakeStatus::Incomplete => {
                    if let Err(e) = read {
                        self.close_connection(key, e);
                    }
                    return;
                }
                HandshakeStatus::Bad => {
                    self.close_connection(key, Error::HandshakeFailed);
                    return;
                }
            }
            if !self.complete_handshake(key) {
                return;
            }
        }

        let Some(connection) = self.connections.get_mut(key) else {
            return;
        };
        // Route what was buffered even when the socket just closed
        let registry = self.poll.registry();
        let routed = loop {
            match connection.client.reader.next_packet() {
                Ok(Some(packet)) => {
                    if let Err(e) = route(&self.shared, registry, connection, packet) {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = read.and(routed) {
            self.close_connection(key, e);
        }
    }

    /// Make a freshly handshaken session visible; false if it was dropped meanwhile
    fn complete_handshake(&mut self, key: &ClientKey) -> bool {
        let Some(session) = self.connections.get(key).map(|c| Arc::clone(&c.session)) else {
            return false;
        };
        session.mark_handshake_complete();
        if !self.shared.devices.complete_handshake(&session) {
            log::debug!("{}: session went away during handshake", key);
            if let Some(session) = self.remove_connection(key) {
                session.drop_session(false);
            }
            return false;
        }

        if self.shared.config.clients.debugger_forwarding
            && let Some(port) = session.debugger_port()
        {
            self.open_debugger_listener(key, &session, port);
        }
        log::info!(
            "{}: client opened (debugger port {:?})",
            key,
            session.debugger_port()
        );

        for handler in self.shared.registry.handlers() {
            if let Err(e) = handler.client_ready(&session) {
                log::warn!("{}: {} not ready: {}", key, handler.name(), e);
            }
        }
        if let Some(info) = self.shared.devices.info(session.serial()) {
            self.shared
                .listeners
                .device_changed(&info, DeviceChange::ClientList);
        }
        true
    }

    fn open_debugger_listener(&mut self, key: &ClientKey, session: &ClientSession, port: u16) {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let mut listener = match TcpListener::bind(addr) {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("{}: cannot listen on debugger port {}: {}", key, port, e);
                session.set_debugger_status(DebuggerStatus::Error);
                return;
            }
        };

        let token = self.allocate_token(Endpoint::Listener(key.clone()));
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)
        {
            log::error!("{}: failed to register listener: {}", key, e);
            self.endpoints.remove(&token);
            session.set_debugger_status(DebuggerStatus::Error);
            return;
        }
        log::debug!("{}: debugger port {}", key, port);
        if let Some(connection) = self.connections.get_mut(key) {
            connection.listener = Some((listener, token));
        }
    }

    fn on_client_writable(&mut self, key: &ClientKey) {
        let registry = self.poll.registry();
        let Some(connection) = self.connections.get_mut(key) else {
            return;
        };
        if let Err(e) = connection.client.flush(registry) {
            self.close_connection(key, e);
        }
    }

    fn accept_debugger(&mut self, key: &ClientKey) {
        loop {
            let Some(connection) = self.connections.get_mut(key) else {
                return;
            };
            let Some((listener, _)) = &connection.listener else {
                return;
            };
            let (mut stream, addr) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("{}: debugger accept failed: {}", key, e);
                    return;
                }
            };

            if connection.debugger.is_some() {
                log::warn!("{}: rejecting second debugger from {}", key, addr);
                let _ = stream.shutdown(Shutdown::Both);
                continue;
            }

            let token = Token(self.next_token);
            if let Err(e) = self
                .poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
            {
                log::warn!("{}: failed to register debugger: {}", key, e);
                continue;
            }
            self.next_token += 1;
            self.endpoints.insert(token, Endpoint::Debugger(key.clone()));
            log::info!("{}: debugger connected from {}", key, addr);
            connection.debugger = Some(Debugger {
                channel: Channel::new(stream, token),
                handshake_done: false,
            });
            self.on_debugger_readable(key);
        }
    }

    fn on_debugger_readable(&mut self, key: &ClientKey) {
        let registry = self.poll.registry();
        let Some(connection) = self.connections.get_mut(key) else {
            return;
        };
        let Some(debugger) = connection.debugger.as_mut() else {
            return;
        };

        let mut result = debugger.channel.fill(&mut self.read_buf);

        if !debugger.handshake_done {
            match check_handshake(debugger.channel.reader.buffered()) {
                HandshakeStatus::Good => {
                    debugger.channel.reader.take_prefix(HANDSHAKE_LEN);
                    debugger.handshake_done = true;
                    if let Err(e) = debugger.channel.queue(registry, HANDSHAKE) {
                        result = Err(e);
                    } else {
                        connection.session.set_debugger_status(DebuggerStatus::Attached);
                    }
                }
                HandshakeStatus::Incomplete => {}
                HandshakeStatus::Bad => result = Err(Error::HandshakeFailed),
            }
        }

        if debugger.handshake_done && result.is_ok() {
            loop {
                match debugger.channel.reader.next_packet() {
                    Ok(Some(packet)) => {
                        if let Err(e) = connection.client.queue(registry, &packet.encode()) {
                            // Client side failed; handled on its own next event
                            log::debug!("{}: relay to client failed: {}", key, e);
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
        }

        if let Err(e) = result {
            self.disconnect_debugger(key, e);
        }
    }

    fn on_debugger_writable(&mut self, key: &ClientKey) {
        let registry = self.poll.registry();
        let Some(debugger) = self
            .connections
            .get_mut(key)
            .and_then(|c| c.debugger.as_mut())
        else {
            return;
        };
        if let Err(e) = debugger.channel.flush(registry) {
            self.disconnect_debugger(key, e);
        }
    }

    /// Drop the debugger link; the client is reopened so the VM resets its debug state
    fn disconnect_debugger(&mut self, key: &ClientKey, reason: Error) {
        let registry = self.poll.registry();
        let Some(connection) = self.connections.get_mut(key) else {
            return;
        };
        let Some(mut debugger) = connection.debugger.take() else {
            return;
        };
        match reason {
            Error::ConnectionClosed => log::info!("{}: debugger disconnected", key),
            other => log::warn!("{}: debugger link failed: {}", key, other),
        }
        debugger.channel.close(registry);
        self.endpoints.remove(&debugger.channel.token);

        let attached = debugger.handshake_done;
        connection.session.set_debugger_status(DebuggerStatus::Default);
        if attached {
            connection.session.request_reopen(None);
        }
    }

    /// Local teardown after a socket error; the session is dropped as well
    ///
    /// Only a session that finished its handshake was ever listed, so only
    /// that case reports a client-list change.
    fn close_connection(&mut self, key: &ClientKey, reason: Error) {
        match &reason {
            Error::ConnectionClosed => log::info!("{}: client closed connection", key),
            Error::Timeout => log::warn!("{}: no handshake reply, dropping", key),
            other => log::warn!("{}: closing client: {}", key, other),
        }
        if let Some(session) = self.remove_connection(key) {
            let listed = session.is_valid();
            session.drop_session(listed);
        }
    }

    fn remove_connection(&mut self, key: &ClientKey) -> Option<Arc<ClientSession>> {
        let mut connection = self.connections.remove(key)?;
        connection.close(self.poll.registry());
        self.endpoints.retain(|_, endpoint| match endpoint {
            Endpoint::Client(k) | Endpoint::Listener(k) | Endpoint::Debugger(k) => k != key,
        });
        for handler in self.shared.registry.handlers() {
            handler.client_disconnected(&connection.session);
        }
        Some(connection.session)
    }
}

/// Deliver one client packet
///
/// Handler failures are logged and the packet discarded; only protocol
/// errors are returned.
fn route(
    shared: &Shared,
    registry: &Registry,
    connection: &mut Connection,
    packet: JdwpPacket,
) -> Result<()> {
    let session = Arc::clone(&connection.session);

    if packet.is_reply() {
        let Some(pending) = connection.pending.remove(&packet.id) else {
            if let Some(debugger) = connection.debugger.as_mut().filter(|d| d.handshake_done) {
                return forward_to_debugger(registry, debugger, &packet);
            }
            if !packet.data.is_empty() {
                deliver(shared, &session, &packet, true, None);
            }
            return Ok(());
        };
        if let Some(code) = packet.error_code().filter(|&c| c != 0) {
            log::warn!(
                "{}: {} request {:#x} failed with error {}",
                session.key(),
                pending.kind,
                packet.id,
                code
            );
            return Ok(());
        }
        if packet.data.is_empty() {
            log::trace!("{}: empty {} reply", session.key(), pending.kind);
            return Ok(());
        }
        let owner = pending.owner.or_else(|| shared.registry.get(pending.kind));
        deliver(shared, &session, &packet, true, owner);
        return Ok(());
    }

    if packet.is_ddm_command() {
        deliver(shared, &session, &packet, false, None);
        return Ok(());
    }

    match connection.debugger.as_mut().filter(|d| d.handshake_done) {
        Some(debugger) => forward_to_debugger(registry, debugger, &packet),
        None => {
            log::debug!(
                "{}: discarding non-DDM packet {:#x} with no debugger",
                session.key(),
                packet.id
            );
            Ok(())
        }
    }
}

fn deliver(
    shared: &Shared,
    session: &ClientSession,
    packet: &JdwpPacket,
    is_reply: bool,
    owner: Option<Arc<dyn ChunkHandler>>,
) {
    let chunk = match Chunk::decode(&packet.data) {
        Ok(chunk) => chunk,
        Err(e) => {
            log::warn!("{}: discarding packet {:#x}: {}", session.key(), packet.id, e);
            return;
        }
    };
    if let Err(e) = shared
        .registry
        .dispatch(session, &chunk, is_reply, packet.id, owner)
    {
        log::warn!("{}: discarding {} chunk: {}", session.key(), chunk.kind, e);
    }
}

fn forward_to_debugger(
    registry: &Registry,
    debugger: &mut Debugger,
    packet: &JdwpPacket,
) -> Result<()> {
    if let Err(e) = debugger.channel.queue(registry, &packet.encode()) {
        // Debugger errors surface on its own socket events
        log::debug!("Relay to debugger failed: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::handlers::heap::HPDU;
    use crate::chunk::handlers::profiling::{MPRQ, MPRS};
    use crate::chunk::handlers::test_support::EventLog;
    use crate::chunk::handlers::FAIL;
    use crate::chunk::packet::PacketHeader;
    use crate::codec::ByteWriter;
    use crate::config::Config;
    use crate::core::listener::Listeners;

    fn shared_with(log: &Arc<EventLog>) -> Arc<Shared> {
        let listeners = Listeners {
            telemetry: vec![log.clone()],
            method_profiling: Some(log.clone()),
            hprof: Some(log.clone()),
            ..Listeners::default()
        };
        Shared::for_tests(Config::default(), listeners)
    }

    /// Nonblocking local end plus blocking peer
    fn socket_pair() -> (TcpStream, std::net::TcpStream) {
        let server = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let local = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();
        let (peer, _) = server.accept().unwrap();
        local.set_nonblocking(true).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        (TcpStream::from_std(local), peer)
    }

    fn connection(shared: &Arc<Shared>, pid: u32) -> (Connection, std::net::TcpStream) {
        let session = Arc::new(ClientSession::new(
            ClientKey::new("emulator-5554", pid),
            None,
            Arc::downgrade(shared),
        ));
        session.mark_handshake_complete();
        let (stream, peer) = socket_pair();
        let connection = Connection {
            session,
            client: Channel::new(stream, Token(1)),
            pending: HashMap::new(),
            listener: None,
            debugger: None,
            handshake_deadline: None,
        };
        (connection, peer)
    }

    fn failure(message: &str) -> Chunk {
        let mut writer = ByteWriter::new();
        writer.i32(1).string(message);
        Chunk::new(FAIL, writer.into_inner())
    }

    #[test]
    fn test_failure_reply_goes_to_request_owner() {
        let log = Arc::new(EventLog::default());
        let shared = shared_with(&log);
        let poll = Poll::new().unwrap();
        let (mut connection, _peer) = connection(&shared, 1);
        {
            let mut data = connection.session.data();
            data.pending_method_profiling_file = Some("/sdcard/app.trace".to_string());
            data.pending_hprof_file = Some("/sdcard/app.hprof".to_string());
        }
        connection.pending.insert(7, Pending { kind: MPRS, owner: None });
        connection.pending.insert(8, Pending { kind: HPDU, owner: None });

        // FAIL is tagged for the profiler; the HPDU request still owns its reply
        route(&shared, poll.registry(), &mut connection, JdwpPacket::ddm_reply(8, &failure("no space")))
            .unwrap();
        route(&shared, poll.registry(), &mut connection, JdwpPacket::ddm_reply(7, &failure("busy")))
            .unwrap();

        assert_eq!(
            log.take(),
            vec!["hprof_failure no space".to_string(), "start_failure busy".to_string()]
        );
        assert!(connection.pending.is_empty());
    }

    #[test]
    fn test_error_reply_is_discarded() {
        let log = Arc::new(EventLog::default());
        let shared = shared_with(&log);
        let poll = Poll::new().unwrap();
        let (mut connection, _peer) = connection(&shared, 2);
        connection.pending.insert(9, Pending { kind: MPRQ, owner: None });
        connection.pending.insert(10, Pending { kind: MPRQ, owner: None });

        let rejected = JdwpPacket {
            id: 9,
            header: PacketHeader::Reply { error_code: 10 },
            data: Chunk::new(MPRQ, vec![1]).encode(),
        };
        route(&shared, poll.registry(), &mut connection, rejected).unwrap();
        assert!(log.take().is_empty());
        assert!(!connection.pending.contains_key(&9));

        let accepted = JdwpPacket::ddm_reply(10, &Chunk::new(MPRQ, vec![1]));
        route(&shared, poll.registry(), &mut connection, accepted).unwrap();
        assert_eq!(log.take(), vec!["profiling_status TracerOn".to_string()]);
    }

    #[test]
    fn test_non_ddm_packets_reach_attached_debugger() {
        let log = Arc::new(EventLog::default());
        let shared = shared_with(&log);
        let poll = Poll::new().unwrap();
        let (mut connection, _peer) = connection(&shared, 3);
        let (debugger_stream, mut debugger_peer) = socket_pair();
        connection.debugger = Some(Debugger {
            channel: Channel::new(debugger_stream, Token(2)),
            handshake_done: false,
        });

        let command = |id| JdwpPacket {
            id,
            header: PacketHeader::Command {
                command_set: 1,
                command: 1,
            },
            data: vec![0, 0, 0, 1],
        };

        // Not relayed before the debugger finished its handshake
        route(&shared, poll.registry(), &mut connection, command(0x20)).unwrap();
        if let Some(debugger) = connection.debugger.as_mut() {
            debugger.handshake_done = true;
        }

        let event = command(0x21);
        let unmatched_reply = JdwpPacket {
            id: 0x22,
            header: PacketHeader::Reply { error_code: 0 },
            data: vec![7],
        };
        route(&shared, poll.registry(), &mut connection, event.clone()).unwrap();
        route(&shared, poll.registry(), &mut connection, unmatched_reply.clone()).unwrap();

        let expected = [event.encode(), unmatched_reply.encode()].concat();
        let mut received = vec![0; expected.len()];
        debugger_peer.read_exact(&mut received).unwrap();
        assert_eq!(received, expected);
        assert!(log.take().is_empty());
    }

    #[test]
    fn test_request_ids_start_high_and_increase() {
        let handle = DispatchHandle::new();
        assert_eq!(handle.next_id(), FIRST_REQUEST_ID);
        assert_eq!(handle.next_id(), FIRST_REQUEST_ID + 1);
    }

    #[test]
    fn test_send_queues_framed_packet() {
        let handle = DispatchHandle::new();
        let key = ClientKey::new("a", 1);
        let chunk = Chunk::new(ChunkType::from_tag(b"HELO"), vec![0, 0, 0, 1]);
        let id = handle.send(&key, &chunk, None).unwrap();

        match handle.receiver.try_recv().unwrap() {
            DispatchCommand::Send {
                key: queued,
                id: queued_id,
                kind,
                packet,
                owner,
            } => {
                assert_eq!(queued, key);
                assert_eq!(queued_id, id);
                assert_eq!(kind, chunk.kind);
                assert!(owner.is_none());
                let (parsed, used) = JdwpPacket::parse(&packet).unwrap().unwrap();
                assert_eq!(used, packet.len());
                assert!(parsed.is_ddm_command());
                assert_eq!(Chunk::decode(&parsed.data).unwrap(), chunk);
            }
            _ => panic!("expected a send command"),
        }
    }
}
