// WebSocket server and main event loop for the relay.
//
// Architecture: thread-per-connection with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts TCP
//   connections, assigns each a `ConnectionId`, and spawns its socket thread.
// - **Socket threads** (one per client): perform the WebSocket handshake,
//   register an outbox with the main thread (`InternalEvent::Connected`),
//   then run `socket::run_pump`: decoded `ClientMessage`s become
//   `InternalEvent::MessageFrom`, and when the pump ends the thread sends
//   `InternalEvent::Disconnected`.
// - **Main thread**: owns the `Registry`, receives events from the channel,
//   and dispatches them. Uses `recv_timeout` bounded by the nearest grace
//   deadline. Each wakeup sweeps expired rooms, which gives us grace timers
//   without a separate timer thread and serializes expiry with rejoins.
//
// The main thread never touches a socket. It hands outgoing messages to
// socket threads through their outbox channels, so a slow client can't
// stall the registry.
//
// Shutdown: `RelayHandle::stop` clears a `keep_running` flag shared by every
// thread, then joins the main thread.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use kipukas_protocol::framing::MAX_MESSAGE_SIZE;
use kipukas_protocol::message::{ClientMessage, ServerMessage};
use kipukas_protocol::types::ConnectionId;
use tracing::{debug, info, warn};

use crate::registry::Registry;
use crate::socket::{PumpSettings, run_pump};

/// Events sent from listener/socket threads to the main thread.
enum InternalEvent {
    Connected {
        conn: ConnectionId,
        outbox: Sender<ServerMessage>,
    },
    MessageFrom {
        conn: ConnectionId,
        message: ClientMessage,
    },
    Disconnected {
        conn: ConnectionId,
    },
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for it to shut down.
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// Block until the relay exits on its own.
    pub fn wait(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    fn shutdown(&mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Configuration for starting a relay server.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_addr: IpAddr,
    /// 0 lets the OS pick a free port.
    pub port: u16,
    /// How long a room survives after a peer drops.
    pub grace_period: Duration,
    /// Socket read timeout; bounds how quickly outgoing messages are flushed.
    pub poll_interval: Duration,
    /// Ping cadence. Connections silent for twice this long are dropped.
    pub keepalive: Duration,
    pub max_message_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8787,
            grace_period: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            keepalive: Duration::from_secs(15),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

/// Start the relay on a background thread. Returns a handle for stopping it
/// and the actual bound address.
pub fn start_relay(config: RelayConfig) -> std::io::Result<(RelayHandle, SocketAddr)> {
    let listener = TcpListener::bind((config.bind_addr, config.port))?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_clone = keep_running.clone();

    info!(%addr, grace_secs = config.grace_period.as_secs(), "relay listening");
    let thread = thread::spawn(move || {
        run_relay(listener, config, keep_running_clone);
    });

    Ok((
        RelayHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Main relay loop. Runs until `keep_running` is set to false.
fn run_relay(listener: TcpListener, config: RelayConfig, keep_running: Arc<AtomicBool>) {
    let mut registry = Registry::new(config.grace_period);
    let (tx, rx): (Sender<InternalEvent>, Receiver<InternalEvent>) = mpsc::channel();

    // Non-blocking so the accept thread can check keep_running periodically.
    listener.set_nonblocking(true).ok();

    let keep_running_listener = keep_running.clone();
    let tx_listener = tx;
    let listener_config = config.clone();
    thread::spawn(move || {
        let mut next_id = 1u64;
        while keep_running_listener.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let conn = ConnectionId(next_id);
                    next_id += 1;
                    debug!(%conn, %peer, "tcp connection accepted");
                    stream.set_nonblocking(false).ok();
                    let tx_conn = tx_listener.clone();
                    let keep_running_conn = keep_running_listener.clone();
                    let settings = listener_config.clone();
                    thread::spawn(move || {
                        connection_thread(stream, conn, tx_conn, keep_running_conn, settings);
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed; listener stopping");
                    break;
                }
            }
        }
    });

    // Main event loop.
    while keep_running.load(Ordering::SeqCst) {
        let now = Instant::now();
        let timeout = registry
            .next_deadline()
            .map(|d| d.saturating_duration_since(now))
            .map_or(config.poll_interval * 10, |d| {
                d.min(config.poll_interval * 10)
            });

        match rx.recv_timeout(timeout) {
            Ok(event) => {
                handle_event(&mut registry, event);
                while let Ok(event) = rx.try_recv() {
                    handle_event(&mut registry, event);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        registry.expire(Instant::now());
    }
    info!("relay stopped");
}

/// Dispatch a single event to the registry.
fn handle_event(registry: &mut Registry, event: InternalEvent) {
    match event {
        InternalEvent::Connected { conn, outbox } => {
            registry.register(conn, outbox);
        }
        InternalEvent::MessageFrom { conn, message } => {
            handle_message(registry, conn, message);
        }
        InternalEvent::Disconnected { conn } => {
            debug!(%conn, "connection closed");
            registry.disconnect(conn, Instant::now());
        }
    }
}

fn handle_message(registry: &mut Registry, conn: ConnectionId, message: ClientMessage) {
    let now = Instant::now();
    let result = match message {
        ClientMessage::Create { name } => registry.create(conn, name, now).map(drop),
        ClientMessage::Join { code, name } => registry.join(conn, &code, &name).map(drop),
        ClientMessage::Rejoin { code, seat } => registry.rejoin(conn, &code, seat, now).map(drop),
        ClientMessage::Relay { data } => registry.relay(conn, data).map(drop),
        ClientMessage::Leave => registry.leave(conn, now),
    };
    if let Err(error) = result {
        registry.reject(conn, &error);
    }
}

/// Per-connection thread: WebSocket handshake, then pump until close.
fn connection_thread(
    stream: TcpStream,
    conn: ConnectionId,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
    config: RelayConfig,
) {
    // Bound the handshake so a silent client can't pin the thread.
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
    let mut socket = match tungstenite::accept(stream) {
        Ok(socket) => socket,
        Err(e) => {
            debug!(%conn, error = %e, "websocket handshake failed");
            return;
        }
    };
    socket
        .get_mut()
        .set_read_timeout(Some(config.poll_interval))
        .ok();

    let (outbox_tx, outbox_rx) = mpsc::channel();
    if tx
        .send(InternalEvent::Connected {
            conn,
            outbox: outbox_tx,
        })
        .is_err()
    {
        return;
    }

    let settings = PumpSettings {
        keepalive: config.keepalive,
        max_message_size: config.max_message_size,
    };
    let exit = run_pump(
        &mut socket,
        &outbox_rx,
        &keep_running,
        &settings,
        |message: ClientMessage| tx.send(InternalEvent::MessageFrom { conn, message }).is_ok(),
    );
    debug!(%conn, ?exit, "socket thread exiting");
    let _ = tx.send(InternalEvent::Disconnected { conn });
}
