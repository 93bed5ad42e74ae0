//! End-to-end engine scenarios against an in-process fake bridge daemon.
//!
//! The fake daemon answers `host:track-devices`, `host:transport:<serial>`,
//! `track-jdwp` and `jdwp:<pid>`, and streams whatever device and pid lists
//! the test pushes into its channels. How each process answers its handshake
//! is scripted per pid.

use crossbeam_channel::{Receiver, Sender, unbounded};
use ddm_bridge::Engine;
use ddm_bridge::adb::{form_request, read_length_prefixed};
use ddm_bridge::client::ClientSession;
use ddm_bridge::client::handshake::HANDSHAKE;
use ddm_bridge::config::Config;
use ddm_bridge::core::{
    Collaborators, DebuggerStatus, DeviceChange, DeviceListener, DeviceState, Listeners,
    TelemetrySink,
};
use ddm_bridge::devices::DeviceInfo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const SERIAL: &str = "emulator-5554";

/// Pid frame that makes the fake close the tracking socket instead
const CLOSE_TRACKING: &str = "close";

/// How a process answers `jdwp:<pid>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Peer {
    Echo,
    /// Accepts the connection, never answers the handshake
    Silent,
    BadReply,
    /// The daemon refuses the transport
    Missing,
}

#[derive(Default)]
struct Script {
    peers: Mutex<HashMap<u32, Peer>>,
    track_connections: AtomicUsize,
    /// Close each tracking socket right after accepting it
    drop_tracking: AtomicBool,
}

impl Script {
    fn set(&self, pid: u32, peer: Peer) {
        self.peers.lock().insert(pid, peer);
    }

    fn peer(&self, pid: u32) -> Peer {
        self.peers.lock().get(&pid).copied().unwrap_or(Peer::Echo)
    }

    fn track_connections(&self) -> usize {
        self.track_connections.load(Ordering::SeqCst)
    }
}

struct FakeBridge {
    address: String,
    devices: Sender<String>,
    pids: Sender<String>,
    script: Arc<Script>,
    stop: Arc<AtomicBool>,
}

impl FakeBridge {
    fn start() -> Self {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = server.local_addr().unwrap().to_string();
        let (devices, device_rx) = unbounded();
        let (pids, pid_rx) = unbounded();
        let script = Arc::new(Script::default());
        let stop = Arc::new(AtomicBool::new(false));

        let accept_stop = Arc::clone(&stop);
        let accept_script = Arc::clone(&script);
        thread::spawn(move || {
            for socket in server.incoming() {
                if accept_stop.load(Ordering::Relaxed) {
                    break;
                }
                let Ok(socket) = socket else { continue };
                let device_rx = device_rx.clone();
                let pid_rx = pid_rx.clone();
                let script = Arc::clone(&accept_script);
                let stop = Arc::clone(&accept_stop);
                thread::spawn(move || serve(socket, device_rx, pid_rx, script, stop));
            }
        });

        Self {
            address,
            devices,
            pids,
            script,
            stop,
        }
    }

    fn bring_online(&self, engine: &Engine) {
        wait_for("monitoring", || engine.is_monitoring());
        self.devices.send(format!("{}\tdevice\n", SERIAL)).unwrap();
        wait_for("device", || {
            engine
                .device(SERIAL)
                .is_some_and(|d| d.state == DeviceState::Online)
        });
    }
}

impl Drop for FakeBridge {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Unblock the accept loop
        let _ = TcpStream::connect(&self.address);
    }
}

fn read_command(socket: &mut TcpStream) -> Option<String> {
    let payload = read_length_prefixed(socket).ok()?;
    String::from_utf8(payload).ok()
}

fn fail(socket: &mut TcpStream, message: &str) {
    let _ = socket.write_all(&[b"FAIL".as_slice(), &form_request(message)].concat());
}

fn serve(
    mut socket: TcpStream,
    device_rx: Receiver<String>,
    pid_rx: Receiver<String>,
    script: Arc<Script>,
    stop: Arc<AtomicBool>,
) {
    let Some(command) = read_command(&mut socket) else {
        return;
    };
    if command == "host:track-devices" {
        socket.write_all(b"OKAY").unwrap();
        stream_frames(socket, device_rx, stop);
        return;
    }
    if command != format!("host:transport:{}", SERIAL) {
        fail(&mut socket, "unknown device");
        return;
    }
    socket.write_all(b"OKAY").unwrap();

    let Some(command) = read_command(&mut socket) else {
        return;
    };
    if command == "track-jdwp" {
        script.track_connections.fetch_add(1, Ordering::SeqCst);
        socket.write_all(b"OKAY").unwrap();
        if !script.drop_tracking.load(Ordering::SeqCst) {
            stream_frames(socket, pid_rx, stop);
        }
        return;
    }
    let Some(pid) = command.strip_prefix("jdwp:").and_then(|p| p.parse().ok()) else {
        fail(&mut socket, "unknown service");
        return;
    };

    let peer = script.peer(pid);
    if peer == Peer::Missing {
        fail(&mut socket, "no such process");
        return;
    }
    socket.write_all(b"OKAY").unwrap();
    let mut handshake = [0u8; 14];
    if socket.read_exact(&mut handshake).is_err() {
        return;
    }
    match peer {
        Peer::Echo => {
            let _ = socket.write_all(&handshake);
        }
        Peer::BadReply => {
            let _ = socket.write_all(b"HTTP/1.1 400 B");
        }
        Peer::Silent | Peer::Missing => {}
    }
    // Swallow chunk requests until the session closes
    let mut sink = Vec::new();
    let _ = socket.read_to_end(&mut sink);
}

fn stream_frames(mut socket: TcpStream, frames: Receiver<String>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match frames.recv_timeout(Duration::from_millis(50)) {
            Ok(frame) if frame == CLOSE_TRACKING => break,
            Ok(frame) => {
                if socket.write_all(&form_request(&frame)).is_err() {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(_) => break,
        }
    }
}

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    fn contains(&self, event: &str) -> bool {
        self.events.lock().iter().any(|e| e == event)
    }

    fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }
}

impl DeviceListener for EventLog {
    fn device_connected(&self, device: &DeviceInfo) {
        self.events.lock().push(format!("connected {}", device.serial));
    }

    fn device_disconnected(&self, device: &DeviceInfo) {
        self.events.lock().push(format!("disconnected {}", device.serial));
    }

    fn device_changed(&self, device: &DeviceInfo, change: DeviceChange) {
        self.events
            .lock()
            .push(format!("changed {} {:?}", device.serial, change));
    }
}

impl TelemetrySink for EventLog {
    fn debugger_status(&self, client: &ClientSession, status: DebuggerStatus) {
        self.events
            .lock()
            .push(format!("debugger {} {:?}", client.pid(), status));
    }
}

fn wait_within(what: &str, limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {}", what);
}

fn wait_for(what: &str, condition: impl FnMut() -> bool) {
    wait_within(what, Duration::from_secs(10), condition);
}

fn client_pids(engine: &Engine) -> Vec<u32> {
    engine.clients(SERIAL).iter().map(|c| c.pid()).collect()
}

fn test_config(address: String) -> Config {
    let mut config = Config::default();
    config.bridge.address = address;
    config.bridge.connect_timeout_ms = 500;
    config.bridge.read_timeout_ms = 2000;
    config.discovery.retry_delay_ms = 50;
    config.clients.debugger_forwarding = false;
    config.clients.debugger_port_base = 28600;
    config.clients.debugger_port_count = 4;
    config.clients.reopen_delay_ms = 10;
    config.clients.handshake_timeout_ms = 2000;
    config
}

fn start_engine(config: Config, log: &Arc<EventLog>) -> Engine {
    let listeners = Listeners {
        devices: vec![log.clone()],
        telemetry: vec![log.clone()],
        ..Listeners::default()
    };
    let mut engine = Engine::new(config, listeners, Collaborators::default()).unwrap();
    engine.start().unwrap();
    engine
}

#[test]
fn test_device_and_client_lifecycle() {
    let bridge = FakeBridge::start();
    let log = Arc::new(EventLog::default());
    let mut engine = start_engine(test_config(bridge.address.clone()), &log);

    bridge.bring_online(&engine);
    assert!(engine.has_initial_device_list());
    assert!(log.contains(&format!("connected {}", SERIAL)));

    bridge.pids.send("123\n456\n".to_string()).unwrap();
    wait_for("two clients", || client_pids(&engine) == vec![123, 456]);
    assert_eq!(engine.available_debugger_ports(), 2);
    for client in engine.clients(SERIAL) {
        assert!(client.is_valid());
        assert!(client.debugger_port().is_some());
    }

    bridge.pids.send("456\n".to_string()).unwrap();
    wait_for("one client", || client_pids(&engine) == vec![456]);
    assert!(engine.client(SERIAL, 123).is_none());
    assert_eq!(engine.available_debugger_ports(), 3);
    wait_for("client list change", || {
        log.contains(&format!("changed {} ClientList", SERIAL))
    });

    let survivor = engine.client(SERIAL, 456).unwrap();
    bridge.devices.send(String::new()).unwrap();
    wait_for("device removal", || {
        log.contains(&format!("disconnected {}", SERIAL))
    });
    assert!(engine.devices().is_empty());
    assert!(!survivor.is_valid());
    assert_eq!(engine.available_debugger_ports(), 4);

    engine.stop();
    assert!(!engine.is_running());
    assert!(!engine.is_monitoring());
}

#[test]
fn test_silent_processes_do_not_delay_live_client() {
    let bridge = FakeBridge::start();
    for pid in [1, 2, 3] {
        bridge.script.set(pid, Peer::Silent);
    }
    let log = Arc::new(EventLog::default());
    let config = test_config(bridge.address.clone());
    let handshake_timeout = config.clients.handshake_timeout();
    let mut engine = start_engine(config, &log);
    bridge.bring_online(&engine);

    bridge.pids.send("1\n2\n3\n456\n".to_string()).unwrap();
    // Well inside a single handshake timeout
    wait_within("live client", handshake_timeout / 2, || {
        client_pids(&engine) == vec![456]
    });

    // Silent peers hold a port until their deadline, then give it back
    wait_for("silent peers dropped", || engine.available_debugger_ports() == 3);
    assert_eq!(client_pids(&engine), vec![456]);
    assert!(engine.client(SERIAL, 456).unwrap().is_valid());
    engine.stop();
}

#[test]
fn test_bad_handshake_leaves_no_session() {
    let bridge = FakeBridge::start();
    bridge.script.set(666, Peer::BadReply);
    bridge.script.set(777, Peer::Missing);
    let log = Arc::new(EventLog::default());
    let mut engine = start_engine(test_config(bridge.address.clone()), &log);
    bridge.bring_online(&engine);

    let client_list = format!("changed {} ClientList", SERIAL);
    bridge.pids.send("666\n777\n".to_string()).unwrap();
    bridge.pids.send("666\n777\n456\n".to_string()).unwrap();
    wait_for("live client", || client_pids(&engine) == vec![456]);
    wait_for("rejected port returned", || engine.available_debugger_ports() == 3);

    thread::sleep(Duration::from_millis(200));
    assert_eq!(client_pids(&engine), vec![456]);
    assert!(engine.client(SERIAL, 666).is_none());
    assert!(engine.client(SERIAL, 777).is_none());
    // Only the live client changed the list
    assert_eq!(log.count(&client_list), 1);
    engine.stop();
}

#[test]
fn test_reopen_honours_pinned_port() {
    let bridge = FakeBridge::start();
    let log = Arc::new(EventLog::default());
    let config = test_config(bridge.address.clone());
    let pinned = config.clients.debugger_port_base + 3;
    let mut engine = start_engine(config, &log);
    bridge.bring_online(&engine);

    bridge.pids.send("456\n".to_string()).unwrap();
    wait_for("client", || client_pids(&engine) == vec![456]);
    let original = engine.client(SERIAL, 456).unwrap();
    assert_ne!(original.debugger_port(), Some(pinned));

    engine.add_client_to_reopen(&original, Some(pinned));
    wait_for("reopened client", || {
        engine
            .client(SERIAL, 456)
            .is_some_and(|c| !Arc::ptr_eq(&c, &original) && c.is_valid())
    });

    let reopened = engine.client(SERIAL, 456).unwrap();
    assert_eq!(reopened.debugger_port(), Some(pinned));
    assert!(!original.is_valid());
    assert_eq!(original.debugger_port(), None);
    assert_eq!(engine.available_debugger_ports(), 3);
    engine.stop();
}

#[test]
fn test_lost_tracking_socket_is_reopened() {
    let bridge = FakeBridge::start();
    let log = Arc::new(EventLog::default());
    let mut engine = start_engine(test_config(bridge.address.clone()), &log);
    bridge.bring_online(&engine);

    bridge.pids.send("456\n".to_string()).unwrap();
    wait_for("client", || client_pids(&engine) == vec![456]);
    assert_eq!(bridge.script.track_connections(), 1);

    bridge.pids.send(CLOSE_TRACKING.to_string()).unwrap();
    wait_for("second tracking socket", || bridge.script.track_connections() == 2);
    // Sessions outlive their tracking socket
    assert_eq!(client_pids(&engine), vec![456]);

    bridge.pids.send("456\n789\n".to_string()).unwrap();
    wait_for("client from new socket", || client_pids(&engine) == vec![456, 789]);
    engine.stop();
}

#[test]
fn test_retracking_gives_up_after_limit() {
    let bridge = FakeBridge::start();
    bridge.script.drop_tracking.store(true, Ordering::SeqCst);
    let log = Arc::new(EventLog::default());
    let mut config = test_config(bridge.address.clone());
    config.clients.max_retrack_attempts = 2;
    let mut engine = start_engine(config, &log);
    bridge.bring_online(&engine);

    // The first socket plus one retry per allowed attempt
    wait_for("retries", || bridge.script.track_connections() == 3);
    thread::sleep(Duration::from_millis(500));
    assert_eq!(bridge.script.track_connections(), 3);
    assert!(engine.device(SERIAL).is_some_and(|d| d.is_online()));
    engine.stop();
}

#[test]
fn test_debugger_attach_and_detach() {
    let bridge = FakeBridge::start();
    let log = Arc::new(EventLog::default());
    let mut config = test_config(bridge.address.clone());
    config.clients.debugger_forwarding = true;
    config.clients.debugger_port_base = 28640;
    let mut engine = start_engine(config, &log);
    bridge.bring_online(&engine);

    bridge.pids.send("456\n".to_string()).unwrap();
    wait_for("client", || client_pids(&engine) == vec![456]);
    let client = engine.client(SERIAL, 456).unwrap();
    let port = client.debugger_port().unwrap();

    let mut debugger = None;
    wait_for("debugger port", || {
        debugger = TcpStream::connect(("127.0.0.1", port)).ok();
        debugger.is_some()
    });
    let mut debugger = debugger.unwrap();
    debugger
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    debugger.write_all(HANDSHAKE).unwrap();
    let mut reply = [0u8; 14];
    debugger.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, HANDSHAKE);

    wait_for("attached", || {
        client.data().debugger_status == DebuggerStatus::Attached
    });
    assert!(log.contains("debugger 456 Attached"));

    drop(debugger);
    wait_for("detached", || log.contains("debugger 456 Default"));
    wait_for("reopened client", || {
        engine
            .client(SERIAL, 456)
            .is_some_and(|c| !Arc::ptr_eq(&c, &client) && c.is_valid())
    });
    assert!(!client.is_valid());
    let reopened = engine.client(SERIAL, 456).unwrap();
    assert_eq!(reopened.data().debugger_status, DebuggerStatus::Default);
    engine.stop();
}

#[test]
fn test_unreachable_daemon_counts_attempts() {
    let address = {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        server.local_addr().unwrap().to_string()
    };
    let mut config = test_config(address);
    config.discovery.retry_delay_ms = 10;

    let mut engine = Engine::new(config, Listeners::default(), Collaborators::default()).unwrap();
    engine.start().unwrap();
    wait_for("connection attempts", || engine.connection_attempt_count() >= 3);
    assert!(!engine.is_monitoring());
    assert!(engine.devices().is_empty());
    // No launcher configured
    assert_eq!(engine.restart_attempt_count(), 0);
    engine.stop();
}
