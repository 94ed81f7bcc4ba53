// Socket pump: one thread owns one WebSocket.
//
// Both ends of the relay use the same loop. The owning thread alternates
// between draining an outbox channel (typed messages to send) and a short
// timed read (frames to deliver). Reads time out every `poll_interval` so
// the thread can flush outgoing messages and notice `keep_running` going
// false without a second thread touching the socket.
//
// Liveness: a ping goes out every `keepalive`. If nothing at all has been
// received for two keepalive periods the peer is considered gone, which is
// how half-open TCP connections (a phone that went to sleep) get detected.
//
// The pump never decides what messages mean. Decoded messages go to the
// caller's `deliver` closure; undecodable text frames are logged and skipped.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::{Duration, Instant};

use kipukas_protocol::framing::{decode_frame, encode_frame};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use tungstenite::{Error as WsError, Message, WebSocket};

/// Why the pump returned.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PumpExit {
    /// Close frame received or socket ended cleanly.
    Closed,
    /// The owner dropped the outbox sender or cleared `keep_running`.
    Stopped,
    /// No traffic for two keepalive periods.
    TimedOut,
    /// Socket-level failure.
    Failed(String),
}

pub(crate) struct PumpSettings {
    pub keepalive: Duration,
    pub max_message_size: usize,
}

/// Run until the socket closes or the owner stops it. `deliver` returns
/// `false` to stop (the consumer is gone).
pub(crate) fn run_pump<S, In, Out>(
    socket: &mut WebSocket<S>,
    outbox: &Receiver<Out>,
    keep_running: &AtomicBool,
    settings: &PumpSettings,
    mut deliver: impl FnMut(In) -> bool,
) -> PumpExit
where
    S: Read + Write,
    In: DeserializeOwned,
    Out: Serialize,
{
    let mut last_seen = Instant::now();
    let mut last_ping = Instant::now();

    let exit = loop {
        if !keep_running.load(Ordering::SeqCst) {
            break PumpExit::Stopped;
        }

        // Outgoing.
        let mut stopped = false;
        loop {
            match outbox.try_recv() {
                Ok(msg) => match encode_frame(&msg) {
                    Ok(frame) => {
                        if let Err(e) = socket.write(frame) {
                            if !is_would_block(&e) {
                                return PumpExit::Failed(e.to_string());
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping unencodable outgoing message"),
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    stopped = true;
                    break;
                }
            }
        }
        if last_ping.elapsed() >= settings.keepalive {
            last_ping = Instant::now();
            if let Err(e) = socket.write(Message::Ping(Vec::new())) {
                if !is_would_block(&e) {
                    return PumpExit::Failed(e.to_string());
                }
            }
        }
        if let Err(e) = socket.flush() {
            if !is_would_block(&e) {
                break closed_or_failed(e);
            }
        }
        if stopped {
            break PumpExit::Stopped;
        }

        // Incoming.
        match socket.read() {
            Ok(Message::Close(_)) => break PumpExit::Closed,
            Ok(Message::Text(text)) if text.len() > settings.max_message_size => {
                last_seen = Instant::now();
                warn!(len = text.len(), "dropping oversized frame");
            }
            Ok(frame) => {
                last_seen = Instant::now();
                match decode_frame::<In>(frame) {
                    Ok(Some(msg)) => {
                        if !deliver(msg) {
                            break PumpExit::Stopped;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "ignoring undecodable frame"),
                }
            }
            Err(e) if is_would_block(&e) => {
                if last_seen.elapsed() > settings.keepalive * 2 {
                    break PumpExit::TimedOut;
                }
            }
            Err(e) => break closed_or_failed(e),
        }
    };

    if exit != PumpExit::Closed {
        let _ = socket.close(None);
    }
    // Sends our close frame, or the reply tungstenite queued for theirs.
    let _ = socket.flush();
    debug!(?exit, "socket pump finished");
    exit
}

fn is_would_block(e: &WsError) -> bool {
    matches!(e, WsError::Io(io) if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut))
}

fn closed_or_failed(e: WsError) -> PumpExit {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => PumpExit::Closed,
        other => PumpExit::Failed(other.to_string()),
    }
}
