// Peer messages: the payloads clients put inside `relay.data`.
//
// The relay forwards these without looking at them; only the client
// protocols (`kipukas_session::combat` and `kipukas_session::sync`) produce
// and consume them. Each variant is small and self-contained so any single
// message can be lost, duplicated, or re-sent after a reconnect without
// corrupting the receiver:
//
// - Combat messages carry the round `Epoch`; receivers drop older epochs.
// - CRDT messages carry base64-encoded `yrs` state vectors / updates, and
//   applying an update twice is a no-op.

use serde::{Deserialize, Serialize};

use crate::types::{CombatRole, Epoch};

/// One player's locked-in combat choice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FistsSubmission {
    pub role: CombatRole,
    /// Card slug, e.g. `"brox_the_defiant"`.
    pub card: String,
    /// 1-based index into the card's keal means.
    pub keal_index: u8,
}

/// Client-to-client messages, tunnelled through `relay.data`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    FistsSync {
        epoch: Epoch,
        submission: FistsSubmission,
    },
    /// Reduced-information submission from a player whose keal means are all
    /// exhausted.
    FinalBlowsSync { epoch: Epoch, card: String },
    /// The sender moved to `epoch`; everything older is void.
    FistsReset { epoch: Epoch },
    FistsOutcome { epoch: Epoch, attacker_won: bool },
    /// Handshake step 1: "here is what I have seen".
    YrsSv { sv: String },
    /// Handshake step 2b: the responder's own state vector.
    YrsSvReply { sv: String },
    /// A diff (handshake steps 2a and 3) or a live mutation.
    YrsUpdate { update: String },
}

impl PeerMessage {
    /// Wrap into the opaque JSON the relay carries.
    pub fn to_data(&self) -> serde_json::Value {
        // Serializing a plain enum of strings/integers cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Interpret relay data. `None` for payloads this client doesn't know.
    pub fn from_data(data: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }
}
