// WebSocket client for connecting to the relay.
//
// Provides a non-blocking interface for a game client's event loop:
// - `open()` checks the URL and returns at once. The TCP connect and the
//   WebSocket handshake run on the socket thread, which then runs the shared
//   pump from `socket.rs`. The outcome arrives as `ClientEvent::Opened` or
//   `ClientEvent::Failed`.
// - `connect()` is `open()` plus a bounded wait for that outcome, for
//   callers that are allowed to block (tests, tools).
// - `send()` queues a message for the socket thread; it never blocks on I/O.
//   Messages queued before the handshake finishes go out right after it.
// - `poll()` drains received events. `Failed` or `Closed` is always last.
//
// This is one connection, not a session. Reconnect policy, rejoin and the
// protocols above live in `kipukas_session::transport`. The client lives in
// the relay crate so integration tests and any other embedding can talk to a
// relay without pulling in the session layer.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kipukas_protocol::framing::{FrameError, MAX_MESSAGE_SIZE, encode_frame};
use kipukas_protocol::message::{ClientMessage, ServerMessage};
use thiserror::Error;
use tracing::debug;
use tungstenite::WebSocket;
use tungstenite::http::Uri;

use crate::socket::{PumpSettings, run_pump};

/// Socket read timeout once connected.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Ping cadence; the connection is considered dead after two silent periods.
const KEEPALIVE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Something that happened on the connection.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// The handshake finished; queued messages are on their way.
    Opened,
    /// The connection could not be established. No other event follows.
    Failed(String),
    Message(ServerMessage),
    /// The socket is gone. Always the last event of an opened connection.
    Closed,
}

/// One WebSocket connection to the relay.
pub struct RelayClient {
    outbox: Option<Sender<ClientMessage>>,
    inbox: Receiver<ClientEvent>,
    opened: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RelayClient {
    /// Start connecting to `url` (`ws://host:port/`) in the background.
    /// Only a malformed URL fails here; everything else is reported through
    /// `poll`. The connect and the handshake are each bounded by `timeout`.
    pub fn open(url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let uri: Uri = url
            .parse()
            .map_err(|e| ClientError::Connect(format!("bad url {url}: {e}")))?;
        if uri.scheme_str() != Some("ws") {
            return Err(ClientError::Connect(format!("unsupported scheme in {url}")));
        }
        let host = uri
            .host()
            .ok_or_else(|| ClientError::Connect(format!("no host in {url}")))?
            .to_string();
        let port = uri.port_u16().unwrap_or(80);
        let url = url.to_string();

        let (outbox_tx, outbox_rx) = mpsc::channel::<ClientMessage>();
        let (inbox_tx, inbox_rx) = mpsc::channel();
        let opened = Arc::new(AtomicBool::new(false));
        let opened_flag = opened.clone();
        let thread = thread::spawn(move || {
            let mut socket = match establish(&url, &host, port, timeout) {
                Ok(socket) => socket,
                Err(e) => {
                    debug!(%url, error = %e, "relay connection failed");
                    let _ = inbox_tx.send(ClientEvent::Failed(e.to_string()));
                    return;
                }
            };
            debug!(%url, "connected to relay");
            opened_flag.store(true, Ordering::SeqCst);
            if inbox_tx.send(ClientEvent::Opened).is_err() {
                return;
            }

            let keep_running = AtomicBool::new(true);
            let settings = PumpSettings {
                keepalive: KEEPALIVE,
                max_message_size: MAX_MESSAGE_SIZE,
            };
            let exit = run_pump(
                &mut socket,
                &outbox_rx,
                &keep_running,
                &settings,
                |msg: ServerMessage| inbox_tx.send(ClientEvent::Message(msg)).is_ok(),
            );
            debug!(?exit, "relay connection ended");
            let _ = inbox_tx.send(ClientEvent::Closed);
        });

        Ok(Self {
            outbox: Some(outbox_tx),
            inbox: inbox_rx,
            opened,
            thread: Some(thread),
        })
    }

    /// `open` and wait until the connection is up. Fails if the relay is
    /// not reachable within `timeout`.
    pub fn connect(url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let client = Self::open(url, timeout)?;
        // Connect and handshake are each bounded by `timeout`.
        match client.inbox.recv_timeout(timeout * 2) {
            Ok(ClientEvent::Opened) => Ok(client),
            Ok(ClientEvent::Failed(reason)) => Err(ClientError::Connect(reason)),
            Ok(_) | Err(RecvTimeoutError::Disconnected) => Err(ClientError::Closed),
            Err(RecvTimeoutError::Timeout) => {
                Err(ClientError::Connect(format!("no answer from {url}")))
            }
        }
    }

    /// Queue a message. Fails if it can't be framed or the socket is gone;
    /// success does not mean it was delivered.
    pub fn send(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        encode_frame(msg)?;
        self.outbox
            .as_ref()
            .ok_or(ClientError::Closed)?
            .send(msg.clone())
            .map_err(|_| ClientError::Closed)
    }

    /// Drain all queued events (non-blocking).
    pub fn poll(&self) -> Vec<ClientEvent> {
        self.inbox.try_iter().collect()
    }

    /// Flush anything queued and close the socket. Waits for the socket
    /// thread only if the connection was up; a handshake still in progress
    /// is left to finish and shut down on its own.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender lets the pump drain the outbox, then stop.
        self.outbox = None;
        if let Some(thread) = self.thread.take() {
            if self.opened.load(Ordering::SeqCst) {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// TCP connect plus WebSocket handshake, on the socket thread.
fn establish(
    url: &str,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<WebSocket<TcpStream>, ClientError> {
    let stream = open_tcp(host, port, timeout)?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| ClientError::Connect(e.to_string()))?;
    let (mut socket, _response) = tungstenite::client::client(url, stream)
        .map_err(|e| ClientError::Handshake(e.to_string()))?;
    socket
        .get_mut()
        .set_read_timeout(Some(POLL_INTERVAL))
        .map_err(|e| ClientError::Connect(e.to_string()))?;
    Ok(socket)
}

fn open_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ClientError> {
    // `Uri::host` keeps the brackets of an IPv6 literal.
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| ClientError::Connect(format!("resolve {host}: {e}")))?;
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(ClientError::Connect(match last_error {
        Some(e) => e.to_string(),
        None => format!("no addresses for {host}"),
    }))
}
