// Core ID types for the multiplayer protocol.
//
// These are lightweight newtypes used by both `message.rs` (relay messages),
// `peer.rs` (client-to-client payloads) and the relay's room registry
// (`kipukas_relay::registry`). Room codes are the only identifier a player
// ever types, so `RoomCode` owns the alphabet and the input normalization.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of characters in a room code.
pub const ROOM_CODE_LEN: usize = 4;

/// Characters a room code may contain. Visually confusable glyphs (I, L, O,
/// 0, 1) are excluded so codes survive being read aloud or off a phone.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Relay-assigned connection ID (one per accepted WebSocket).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A normalized room code: exactly `ROOM_CODE_LEN` upper-case characters from
/// `ROOM_CODE_ALPHABET`. Construct with `RoomCode::parse` for user input or
/// `RoomCode::from_alphabet_indices` when generating. Deserializing goes
/// through `parse` too, so a decoded code is always valid.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("invalid room code {0:?}")]
pub struct InvalidRoomCode(pub String);

impl RoomCode {
    /// Parse user input. Surrounding whitespace is ignored and lower-case
    /// letters are accepted. Returns `None` if the result is not a valid code.
    pub fn parse(input: &str) -> Option<Self> {
        let upper = input.trim().to_ascii_uppercase();
        if upper.len() != ROOM_CODE_LEN {
            return None;
        }
        if !upper.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b)) {
            return None;
        }
        Some(Self(upper))
    }

    /// Build a code from alphabet positions (each taken modulo the alphabet
    /// length). Used by the relay's code generator.
    pub fn from_alphabet_indices(indices: [usize; ROOM_CODE_LEN]) -> Self {
        let code = indices
            .iter()
            .map(|i| ROOM_CODE_ALPHABET[i % ROOM_CODE_ALPHABET.len()] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomCode {
    type Error = InvalidRoomCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or(InvalidRoomCode(value))
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which of a room's two places a connection holds. The creator's place is
/// the one `create` opened; the other is the joiner's.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Seat {
    Creator,
    Joiner,
}

impl Seat {
    pub fn for_creator(is_creator: bool) -> Self {
        if is_creator { Self::Creator } else { Self::Joiner }
    }
}

/// Which side of a combat a player declared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CombatRole {
    Attacking,
    Defending,
}

impl CombatRole {
    pub fn opposite(self) -> Self {
        match self {
            Self::Attacking => Self::Defending,
            Self::Defending => Self::Attacking,
        }
    }
}

/// Combat round number. Every reset starts a new epoch; messages tagged with
/// an older epoch are stale.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}
