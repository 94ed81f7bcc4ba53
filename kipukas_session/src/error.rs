// Error taxonomy for the session layer.
//
// `SessionError` groups failures by how the caller should react:
// - `Transport`: the socket is down. Recovery is automatic (reconnect with
//   backoff) until the attempt budget runs out.
// - `Protocol`: the relay refused the room request. Surfaced immediately;
//   the stored session is cleared so nothing retries it.
// - `Conflict`: a local action that can't be sent as-is (duplicate role,
//   outcome before resolution). Caught before anything is transmitted.
// - `Codec`: a CRDT payload or persisted record failed to decode.
// - `Store`: the persistent store failed.
//
// A duplicate or already-known CRDT update is not an error at all; applying
// it is a no-op.

use kipukas_protocol::types::CombatRole;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Conflict(#[from] StateConflict),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected to the relay")]
    NotConnected,
    #[error("could not connect after {attempts} attempts")]
    GaveUp { attempts: u32 },
    #[error("send failed: {0}")]
    Send(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("relay refused: {0}")]
    Rejected(String),
    #[error("invalid room code {0:?}")]
    InvalidCode(String),
    #[error("already in a room")]
    AlreadyInRoom,
    #[error("not in a room")]
    NotInRoom,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StateConflict {
    #[error("both players chose {0:?}")]
    SameRole(CombatRole),
    #[error("round already resolved")]
    AlreadyResolved,
    #[error("round not resolved yet")]
    NotResolved,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("malformed crdt payload: {0}")]
    Decode(String),
    #[error("crdt update rejected: {0}")]
    Apply(String),
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid store key {0:?}")]
    InvalidKey(String),
}
