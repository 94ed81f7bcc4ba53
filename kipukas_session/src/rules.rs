// Seam to the game-rules engine.
//
// Combat math and card data live outside the session layer. The session
// calls `resolve` once a round has both submissions, and `apply_outcome`
// once per round when the result is known. Each client applies the outcome
// to its own private state only.

use kipukas_protocol::types::{CombatRole, Epoch};

use crate::combat::Submission;

/// A round with both sides locked in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Matchup {
    pub epoch: Epoch,
    pub local_role: CombatRole,
    pub attacker: Submission,
    pub defender: Submission,
    /// The defender is out of keal means.
    pub final_blows: bool,
}

/// The agreed result of a round, from the local player's side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub epoch: Epoch,
    pub attacker_won: bool,
    pub local_role: CombatRole,
    pub local: Submission,
    pub final_blows: bool,
}

impl Outcome {
    /// Whether the local player's card takes the hit.
    pub fn local_lost(&self) -> bool {
        self.attacker_won == (self.local_role == CombatRole::Defending)
    }
}

pub trait RulesEngine {
    /// Evaluate a locked-in round. The returned report is opaque to the
    /// session and handed back to the caller unchanged.
    fn resolve(&mut self, matchup: &Matchup) -> serde_json::Value;

    /// Record the round's result in local game state.
    fn apply_outcome(&mut self, outcome: &Outcome);
}

/// Rules engine that evaluates nothing. For headless clients and tests.
#[derive(Clone, Debug, Default)]
pub struct NullRules;

impl RulesEngine for NullRules {
    fn resolve(&mut self, _matchup: &Matchup) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn apply_outcome(&mut self, _outcome: &Outcome) {}
}
