// Shared turn timers as a `yrs` document.
//
// Document layout:
//
//   yrs::Doc
//   └── "alarms" (ArrayRef)
//       ├── [0] (MapRef) { "remaining": f64, "name": String, "color_set": String }
//       └── ...
//
// Every mutation returns the binary update it produced (a diff against the
// state vector taken just before the change), ready to broadcast. Remote
// updates go through `apply`, which is idempotent: an update the document
// already contains changes nothing.
//
// Out-of-order delivery: yrs stashes blocks whose predecessors are missing,
// but it discards deletions that target a client it has never seen. An
// update whose deletions reach past our state vector is therefore kept in
// `held` and re-applied after every later merge until its targets exist.
//
// Garbage collection is off. yrs skips a whole delete range when the range
// starts on a collected block, which loses concurrent deletes of adjacent
// alarms. The alarm list is small, so tombstones cost little.
//
// This module deals only in raw bytes. Base64 for the wire and for the
// persisted snapshot is added by `sync.rs`.

use tracing::debug;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, Map, MapPrelim, Options, Out, ReadTxn, StateVector, Transact,
    Update, WriteTxn,
};

use crate::error::CodecError;
use crate::timers::{Alarm, DEFAULT_COLOR};

const ALARMS: &str = "alarms";

pub struct SharedTimers {
    doc: Doc,
    alarms: ArrayRef,
    /// Remote updates not yet fully integrated, oldest first.
    held: Vec<Vec<u8>>,
}

impl SharedTimers {
    /// An empty document with the root array in place.
    pub fn new() -> Self {
        let doc = Doc::with_options(Options {
            skip_gc: true,
            ..Options::default()
        });
        let alarms = {
            let mut txn = doc.transact_mut();
            txn.get_or_insert_array(ALARMS)
        };
        Self {
            doc,
            alarms,
            held: Vec::new(),
        }
    }

    /// A fresh document holding copies of `local`.
    pub fn seeded(local: &[Alarm]) -> Self {
        let mut shared = Self::new();
        for alarm in local {
            shared.push(alarm);
        }
        shared
    }

    /// Rebuild from `encode_state` output.
    pub fn restore(state: &[u8]) -> Result<Self, CodecError> {
        let mut shared = Self::new();
        shared.apply(state)?;
        Ok(shared)
    }

    /// Append an alarm. `turns` and `color_set` are normalized like local
    /// alarms.
    pub fn add(&mut self, turns: i32, name: &str, color_set: &str) -> Vec<u8> {
        let before = self.doc.transact().state_vector();
        self.push(&Alarm::new(turns, name, color_set));
        self.diff_since(&before)
    }

    /// Remove completed alarms and decrement the rest. `None` when there was
    /// nothing to tick.
    pub fn tick(&mut self) -> Option<Vec<u8>> {
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            let len = self.alarms.len(&txn);
            if len == 0 {
                return None;
            }

            let completed: Vec<u32> = (0..len)
                .filter(|&i| remaining_at(&self.alarms, &txn, i).is_some_and(|r| r <= 0.0))
                .collect();
            for &index in completed.iter().rev() {
                self.alarms.remove(&mut txn, index);
            }

            for i in 0..self.alarms.len(&txn) {
                if let Some(Out::YMap(map)) = self.alarms.get(&txn, i) {
                    if let Some(Out::Any(Any::Number(r))) = map.get(&txn, "remaining") {
                        map.insert(&mut txn, "remaining", Any::from(r - 1.0));
                    }
                }
            }
        }
        Some(self.diff_since(&before))
    }

    /// Remove by index. `None` (and no change) if out of range.
    pub fn remove(&mut self, index: u32) -> Option<Vec<u8>> {
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            if index >= self.alarms.len(&txn) {
                return None;
            }
            self.alarms.remove(&mut txn, index);
        }
        Some(self.diff_since(&before))
    }

    pub fn alarms(&self) -> Vec<Alarm> {
        let txn = self.doc.transact();
        let len = self.alarms.len(&txn);
        let mut result = Vec::with_capacity(len as usize);
        for i in 0..len {
            if let Some(Out::YMap(map)) = self.alarms.get(&txn, i) {
                let remaining = match map.get(&txn, "remaining") {
                    Some(Out::Any(Any::Number(n))) => n as i32,
                    _ => 0,
                };
                let name = match map.get(&txn, "name") {
                    Some(Out::Any(Any::String(s))) => s.to_string(),
                    _ => String::new(),
                };
                let color_set = match map.get(&txn, "color_set") {
                    Some(Out::Any(Any::String(s))) => s.to_string(),
                    _ => DEFAULT_COLOR.to_string(),
                };
                result.push(Alarm {
                    remaining,
                    name,
                    color_set,
                });
            }
        }
        result
    }

    /// Encoded summary of what this replica has seen.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything the replica with state vector `remote_sv` is missing.
    pub fn diff_for(&self, remote_sv: &[u8]) -> Result<Vec<u8>, CodecError> {
        let sv = StateVector::decode_v1(remote_sv).map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(self.diff_since(&sv))
    }

    /// Merge a remote update. Already-known content is a no-op, and an
    /// update that arrives ahead of what it depends on takes effect once the
    /// missing part shows up.
    pub fn apply(&mut self, update: &[u8]) -> Result<(), CodecError> {
        let before = self.doc.transact().state_vector();
        let decoded = decode(update)?;
        self.integrate(decoded)?;
        if !self.settled(update, &before)? {
            debug!(held = self.held.len() + 1, "crdt update held for missing state");
            self.held.push(update.to_vec());
        }
        self.retry_held()
    }

    /// Number of remote updates still waiting on state from elsewhere.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// The whole document as one update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.diff_since(&StateVector::default())
    }

    fn push(&mut self, alarm: &Alarm) {
        let mut txn = self.doc.transact_mut();
        let entry = MapPrelim::from([
            ("remaining".to_string(), Any::from(f64::from(alarm.remaining))),
            ("name".to_string(), Any::from(alarm.name.clone())),
            ("color_set".to_string(), Any::from(alarm.color_set.clone())),
        ]);
        let len = self.alarms.len(&txn);
        self.alarms.insert(&mut txn, len, entry);
    }

    fn diff_since(&self, sv: &StateVector) -> Vec<u8> {
        self.doc.transact().encode_diff_v1(sv)
    }

    fn integrate(&self, update: Update) -> Result<(), CodecError> {
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CodecError::Apply(e.to_string()))
    }

    /// Whether `update` is fully in the document: its blocks are integrated
    /// and every deletion it carries targeted state known in `before`.
    fn settled(&self, update: &[u8], before: &StateVector) -> Result<bool, CodecError> {
        let update = decode(update)?;
        let now = self.doc.transact().state_vector();
        let blocks_in = update
            .state_vector()
            .iter()
            .all(|(client, &clock)| now.get(client) >= clock);
        let deletes_in = update
            .delete_set()
            .iter()
            .all(|(client, ranges)| ranges.iter().all(|r| before.get(client) >= r.end));
        Ok(blocks_in && deletes_in)
    }

    /// Re-apply held updates until a full pass changes nothing.
    fn retry_held(&mut self) -> Result<(), CodecError> {
        loop {
            let mut progress = false;
            let mut still_held = Vec::with_capacity(self.held.len());
            for update in std::mem::take(&mut self.held) {
                let before = self.doc.transact().state_vector();
                self.integrate(decode(&update)?)?;
                if self.settled(&update, &before)? {
                    progress = true;
                } else {
                    if self.doc.transact().state_vector() != before {
                        progress = true;
                    }
                    still_held.push(update);
                }
            }
            self.held = still_held;
            if !progress || self.held.is_empty() {
                return Ok(());
            }
        }
    }
}

fn decode(update: &[u8]) -> Result<Update, CodecError> {
    Update::decode_v1(update).map_err(|e| CodecError::Decode(e.to_string()))
}

impl Default for SharedTimers {
    fn default() -> Self {
        Self::new()
    }
}

fn remaining_at<T: ReadTxn>(alarms: &ArrayRef, txn: &T, index: u32) -> Option<f64> {
    match alarms.get(txn, index) {
        Some(Out::YMap(map)) => match map.get(txn, "remaining") {
            Some(Out::Any(Any::Number(r))) => Some(r),
            _ => None,
        },
        _ => None,
    }
}
