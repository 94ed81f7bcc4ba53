// Turn timers ("alarms"): countdowns measured in diel cycles.
//
// `LocalTimers` is the single-player list. While in a room the same
// operations run against the shared CRDT document (`crdt.rs`) instead; the
// local list seeds that document on first entry and receives its contents
// back on every change and on disconnect.
//
// Tick semantics: an alarm at 0 is "complete" and shown until the next tick,
// which removes it. Every other alarm decrements.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Allowed `color_set` values; anything else becomes `DEFAULT_COLOR`.
pub const COLORS: [&str; 5] = ["red", "green", "blue", "yellow", "pink"];
pub const DEFAULT_COLOR: &str = "red";

pub const MIN_TURNS: i32 = 1;
pub const MAX_TURNS: i32 = 99;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alarm {
    pub remaining: i32,
    pub name: String,
    pub color_set: String,
}

impl Alarm {
    /// A new alarm with `turns` clamped to the valid range and the color
    /// validated.
    pub fn new(turns: i32, name: &str, color_set: &str) -> Self {
        Self {
            remaining: turns.clamp(MIN_TURNS, MAX_TURNS),
            name: name.to_string(),
            color_set: validate_color(color_set).to_string(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.remaining <= 0
    }
}

pub fn validate_color(color: &str) -> &'static str {
    COLORS
        .iter()
        .find(|c| **c == color)
        .copied()
        .unwrap_or(DEFAULT_COLOR)
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalTimers {
    alarms: Vec<Alarm>,
}

impl LocalTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, turns: i32, name: &str, color_set: &str) {
        self.alarms.push(Alarm::new(turns, name, color_set));
    }

    pub fn tick(&mut self) {
        self.alarms.retain(|a| !a.is_complete());
        for alarm in &mut self.alarms {
            alarm.remaining -= 1;
        }
    }

    /// Remove by index. Returns false (and changes nothing) if out of range.
    pub fn remove(&mut self, index: usize) -> bool {
        if index < self.alarms.len() {
            self.alarms.remove(index);
            true
        } else {
            false
        }
    }

    pub fn alarms(&self) -> &[Alarm] {
        &self.alarms
    }

    /// Overwrite with the shared document's list (export on leave).
    pub fn replace(&mut self, alarms: Vec<Alarm>) {
        self.alarms = alarms;
    }

    pub fn to_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(json)?)
    }
}
