// CRDT sync engine: the state-vector handshake and live update broadcast.
//
// Handshake on every (re)pairing, started by the room creator:
//
//   A → B   yrs_sv        { A's state vector }
//   B → A   yrs_update    { what A is missing }
//   B → A   yrs_sv_reply  { B's state vector }
//   A → B   yrs_update    { what B is missing }
//
// After that both documents hold the union of both sides' edits. Mutations
// made later are broadcast as `yrs_update` straight away with no
// acknowledgement; a lost one is recovered by the next handshake, and a
// duplicate is absorbed by the merge.
//
// Binary payloads use standard base64 on the wire. The persisted snapshot
// (`snapshot`/`restore`) uses URL-safe base64 without padding so it can live
// in any string store.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use kipukas_protocol::peer::PeerMessage;
use tracing::debug;

use crate::crdt::SharedTimers;
use crate::error::CodecError;
use crate::timers::Alarm;

/// Where this replica is in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handshake {
    Idle,
    /// Sent our state vector, waiting for the peer's reply.
    AwaitingReply,
    /// Both diffs exchanged (from our side's point of view).
    Complete,
}

/// Result of handling one incoming sync message.
#[derive(Debug, Default)]
pub struct SyncReply {
    /// Messages to relay back, in order.
    pub outbound: Vec<PeerMessage>,
    /// The visible alarm list changed.
    pub changed: bool,
}

pub struct SyncEngine {
    timers: SharedTimers,
    handshake: Handshake,
}

impl SyncEngine {
    /// Start from an empty document.
    pub fn empty() -> Self {
        Self::from_timers(SharedTimers::new())
    }

    /// First room entry: copy the local-only alarms in before any handshake.
    pub fn seeded(local: &[Alarm]) -> Self {
        Self::from_timers(SharedTimers::seeded(local))
    }

    /// Returning to a room: rebuild from a persisted snapshot.
    pub fn restore(snapshot: &str) -> Result<Self, CodecError> {
        if snapshot.is_empty() {
            return Ok(Self::empty());
        }
        let bytes = URL_SAFE_NO_PAD.decode(snapshot)?;
        Ok(Self::from_timers(SharedTimers::restore(&bytes)?))
    }

    fn from_timers(timers: SharedTimers) -> Self {
        Self {
            timers,
            handshake: Handshake::Idle,
        }
    }

    pub fn handshake(&self) -> Handshake {
        self.handshake
    }

    /// Step 1: our state vector.
    pub fn start_handshake(&mut self) -> PeerMessage {
        self.handshake = Handshake::AwaitingReply;
        debug!("crdt handshake started");
        PeerMessage::YrsSv {
            sv: STANDARD.encode(self.timers.state_vector()),
        }
    }

    /// Handle a CRDT peer message. Non-CRDT messages are ignored.
    pub fn handle(&mut self, msg: &PeerMessage) -> Result<SyncReply, CodecError> {
        match msg {
            PeerMessage::YrsSv { sv } => {
                // Step 2: their missing diff, then our state vector.
                let diff = self.timers.diff_for(&STANDARD.decode(sv)?)?;
                self.handshake = Handshake::Complete;
                debug!("crdt handshake: answering state vector");
                Ok(SyncReply {
                    outbound: vec![
                        PeerMessage::YrsUpdate {
                            update: STANDARD.encode(diff),
                        },
                        PeerMessage::YrsSvReply {
                            sv: STANDARD.encode(self.timers.state_vector()),
                        },
                    ],
                    changed: false,
                })
            }
            PeerMessage::YrsSvReply { sv } => {
                // Step 3: what the responder is missing.
                let diff = self.timers.diff_for(&STANDARD.decode(sv)?)?;
                self.handshake = Handshake::Complete;
                debug!("crdt handshake complete");
                Ok(SyncReply {
                    outbound: vec![PeerMessage::YrsUpdate {
                        update: STANDARD.encode(diff),
                    }],
                    changed: false,
                })
            }
            PeerMessage::YrsUpdate { update } => {
                let before = self.timers.alarms();
                self.timers.apply(&STANDARD.decode(update)?)?;
                Ok(SyncReply {
                    outbound: Vec::new(),
                    changed: self.timers.alarms() != before,
                })
            }
            _ => Ok(SyncReply::default()),
        }
    }

    pub fn add(&mut self, turns: i32, name: &str, color_set: &str) -> PeerMessage {
        update_message(self.timers.add(turns, name, color_set))
    }

    pub fn tick(&mut self) -> Option<PeerMessage> {
        self.timers.tick().map(update_message)
    }

    pub fn remove(&mut self, index: usize) -> Option<PeerMessage> {
        let index = u32::try_from(index).ok()?;
        self.timers.remove(index).map(update_message)
    }

    pub fn alarms(&self) -> Vec<Alarm> {
        self.timers.alarms()
    }

    /// Full document for the navigation-surviving store.
    pub fn snapshot(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.timers.encode_state())
    }
}

fn update_message(bytes: Vec<u8>) -> PeerMessage {
    PeerMessage::YrsUpdate {
        update: STANDARD.encode(bytes),
    }
}
