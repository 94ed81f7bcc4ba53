// Relay messages for client-relay communication.
//
// Two enums define the full relay vocabulary:
// - `ClientMessage`: sent by game clients to the relay.
// - `ServerMessage`: sent by the relay to game clients.
//
// Both are internally tagged JSON (`{"type": "join", "code": ..}`) so the
// browser client and the relay agree on a self-describing shape. Room codes
// arrive from clients as raw strings; the relay normalizes them with
// `RoomCode::parse` and replies with the canonical form.
//
// Relay payloads are opaque `serde_json::Value`s; the relay never inspects
// them. Client protocols put a `PeerMessage` (see `peer.rs`) in there.

use serde::{Deserialize, Serialize};

use crate::types::{RoomCode, Seat};

/// Messages sent by a client to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a new room; the relay picks the code.
    Create { name: String },
    /// Enter an existing room as the second occupant.
    Join { code: String, name: String },
    /// Re-enter a room after a reconnect. Skips the existence check and
    /// cancels any pending eviction. With `seat` set, a connection still
    /// holding that seat is taken to be this client's dead socket and is
    /// replaced.
    Rejoin {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seat: Option<Seat>,
    },
    /// Forward `data` verbatim to the other occupant.
    Relay { data: serde_json::Value },
    /// Leaving on purpose.
    Leave,
}

/// Messages sent by the relay to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RoomCreated { code: RoomCode, name: String },
    RoomJoined { code: RoomCode, name: String },
    /// Both seats are now occupied.
    PeerJoined,
    /// The other occupant's connection closed.
    PeerLeft,
    Relay { data: serde_json::Value },
    Error { message: String },
}
