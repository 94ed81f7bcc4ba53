// JSON-over-WebSocket message framing.
//
// Every protocol message travels as exactly one WebSocket text frame holding
// one JSON document. `encode_frame` / `decode_frame` are the only places that
// turn typed messages into `tungstenite::Message`s and back, so both the
// relay and the client share one size limit and one notion of "frame we
// understand".
//
// A `MAX_MESSAGE_SIZE` constant (1 MiB) protects against unbounded
// allocation. Full CRDT snapshots are the largest expected payloads and stay
// in the low kilobytes.
//
// Control frames (ping/pong/close) decode to `Ok(None)`: tungstenite answers
// pings itself, and callers check for `Message::Close` before decoding.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tungstenite::Message;

/// Maximum allowed message size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("message too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },
    #[error("unexpected binary frame")]
    Binary,
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize `msg` into a single text frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Message, FrameError> {
    let text = serde_json::to_string(msg)?;
    check_len(text.len())?;
    Ok(Message::Text(text))
}

/// Decode a received frame. Returns `Ok(None)` for control frames.
pub fn decode_frame<T: DeserializeOwned>(frame: Message) -> Result<Option<T>, FrameError> {
    match frame {
        Message::Text(text) => {
            check_len(text.len())?;
            Ok(Some(serde_json::from_str(&text)?))
        }
        Message::Binary(_) => Err(FrameError::Binary),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => Ok(None),
    }
}

fn check_len(len: usize) -> Result<(), FrameError> {
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}
