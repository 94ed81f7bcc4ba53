// Combat round state machine ("fists").
//
// Each player locks in a role, card and keal means; once both submissions
// for the same round are present the round resolves through the rules
// engine. One player then answers "did you win?", and the derived
// `attacker_won` boolean (not the raw answer) is relayed so both sides apply
// the same result to their own state.
//
//   Idle ──submit──→ LocalSubmitted ──remote──→ Resolved ──reset──→ Idle
//     └──remote──→ RemoteSubmitted ──submit──┘
//
// A changed remote submission reopens a resolved round until an outcome is
// recorded, so two players correcting a conflict at the same moment see the
// new conflict instead of each resolving against the other's old choice.
//
// Rounds are numbered by `Epoch`. A reset bumps the epoch; messages tagged
// with an older epoch are stale and dropped, and a message with a newer
// epoch means the peer reset first, so local state moves forward to match.
//
// Final Blows: a player whose card has no keal means left submits only the
// card. That player is always the defender and the other side the attacker,
// whatever role it picked. Two Final Blows submissions are a role conflict.
//
// Everything here is pure state. Sending messages and calling the rules
// engine is the session manager's job.

use kipukas_protocol::peer::{FistsSubmission, PeerMessage};
use kipukas_protocol::types::{CombatRole, Epoch};
use tracing::debug;

use crate::error::StateConflict;
use crate::rules::{Matchup, Outcome};

/// One side's locked-in choice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submission {
    Fists(FistsSubmission),
    FinalBlows { card: String },
}

impl Submission {
    pub fn card(&self) -> &str {
        match self {
            Self::Fists(s) => &s.card,
            Self::FinalBlows { card } => card,
        }
    }

    /// The role this submission claims on its own.
    pub fn declared_role(&self) -> CombatRole {
        match self {
            Self::Fists(s) => s.role,
            Self::FinalBlows { .. } => CombatRole::Defending,
        }
    }

    fn to_message(&self, epoch: Epoch) -> PeerMessage {
        match self {
            Self::Fists(s) => PeerMessage::FistsSync {
                epoch,
                submission: s.clone(),
            },
            Self::FinalBlows { card } => PeerMessage::FinalBlowsSync {
                epoch,
                card: card.clone(),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CombatPhase {
    Idle,
    LocalSubmitted,
    RemoteSubmitted,
    /// Both submitted the same role; either side may resubmit.
    Conflict(CombatRole),
    Resolved,
}

/// What a local submission produced.
#[derive(Debug)]
pub struct LocalStep {
    pub outbound: PeerMessage,
    pub resolved: Option<Matchup>,
}

/// What a remote submission did to the round.
#[derive(Debug, PartialEq)]
pub enum RemoteEffect {
    /// From an earlier round; ignored.
    Stale,
    /// Already known; ignored.
    Duplicate,
    /// Stored; waiting for the local player.
    PeerReady,
    Conflict(CombatRole),
    Resolved(Matchup),
}

/// What reporting an outcome produced.
#[derive(Debug)]
pub struct OutcomeStep {
    pub outbound: PeerMessage,
    /// `Some` the first time the round's outcome is settled.
    pub apply: Option<Outcome>,
}

#[derive(Debug, Default)]
pub struct CombatSession {
    epoch: Epoch,
    local: Option<Submission>,
    remote: Option<Submission>,
    matchup: Option<Matchup>,
    attacker_won: Option<bool>,
}

impl CombatSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// An idle round numbered `epoch`, for a client returning to a room.
    pub fn at_epoch(epoch: Epoch) -> Self {
        Self {
            epoch,
            ..Self::default()
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn local(&self) -> Option<&Submission> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> Option<&Submission> {
        self.remote.as_ref()
    }

    pub fn matchup(&self) -> Option<&Matchup> {
        self.matchup.as_ref()
    }

    pub fn phase(&self) -> CombatPhase {
        if self.matchup.is_some() {
            return CombatPhase::Resolved;
        }
        match (&self.local, &self.remote) {
            (None, None) => CombatPhase::Idle,
            (Some(_), None) => CombatPhase::LocalSubmitted,
            (None, Some(_)) => CombatPhase::RemoteSubmitted,
            (Some(l), Some(r)) => match assign_roles(l, r) {
                Err(role) => CombatPhase::Conflict(role),
                Ok(_) => CombatPhase::Resolved,
            },
        }
    }

    /// Lock in a regular submission.
    pub fn submit(&mut self, submission: FistsSubmission) -> Result<LocalStep, StateConflict> {
        self.submit_local(Submission::Fists(submission))
    }

    /// Lock in a Final Blows submission.
    pub fn submit_final_blows(&mut self, card: String) -> Result<LocalStep, StateConflict> {
        self.submit_local(Submission::FinalBlows { card })
    }

    fn submit_local(&mut self, submission: Submission) -> Result<LocalStep, StateConflict> {
        if self.matchup.is_some() {
            return Err(StateConflict::AlreadyResolved);
        }
        // Validate before anything is stored or sent.
        if let Some(remote) = &self.remote {
            assign_roles(&submission, remote).map_err(StateConflict::SameRole)?;
        }
        let outbound = submission.to_message(self.epoch);
        self.local = Some(submission);
        Ok(LocalStep {
            outbound,
            resolved: self.try_resolve(),
        })
    }

    /// Handle a `fists_sync` or `final_blows_sync` from the peer.
    pub fn on_remote(&mut self, epoch: Epoch, submission: Submission) -> RemoteEffect {
        if epoch < self.epoch {
            debug!(?epoch, current = ?self.epoch, "stale combat submission ignored");
            return RemoteEffect::Stale;
        }
        if epoch > self.epoch {
            debug!(?epoch, "peer moved to a newer round");
            self.start_epoch(epoch);
        }
        if self.remote.as_ref() == Some(&submission) {
            return RemoteEffect::Duplicate;
        }
        if self.matchup.is_some() {
            if self.attacker_won.is_some() {
                debug!(card = submission.card(), "submission after the outcome ignored");
                return RemoteEffect::Duplicate;
            }
            // The peer changed its choice after we resolved against the old
            // one (both sides correcting a conflict at once). Resolve again.
            debug!(card = submission.card(), "peer replaced its submission");
            self.matchup = None;
        }

        if let Some(local) = &self.local {
            if let Err(role) = assign_roles(local, &submission) {
                debug!(?role, card = submission.card(), "combat role conflict");
                self.remote = Some(submission);
                return RemoteEffect::Conflict(role);
            }
        }
        self.remote = Some(submission);
        match self.try_resolve() {
            Some(matchup) => RemoteEffect::Resolved(matchup),
            None => RemoteEffect::PeerReady,
        }
    }

    /// The local player answers "did you win?". The derived `attacker_won`
    /// is what goes on the wire.
    pub fn report_outcome(&mut self, won: bool) -> Result<OutcomeStep, StateConflict> {
        let matchup = self.matchup.as_ref().ok_or(StateConflict::NotResolved)?;
        let derived = derive_attacker_won(matchup.local_role, won);
        // The first answer for a round sticks; repeats re-send it.
        let apply = match self.attacker_won {
            Some(_) => None,
            None => {
                self.attacker_won = Some(derived);
                self.outcome(derived)
            }
        };
        Ok(OutcomeStep {
            outbound: PeerMessage::FistsOutcome {
                epoch: self.epoch,
                attacker_won: self.attacker_won.unwrap_or(derived),
            },
            apply,
        })
    }

    /// Handle a `fists_outcome` from the peer. `Some` if the outcome should
    /// be applied now.
    pub fn on_remote_outcome(&mut self, epoch: Epoch, attacker_won: bool) -> Option<Outcome> {
        if epoch != self.epoch {
            debug!(?epoch, current = ?self.epoch, "outcome for another round ignored");
            return None;
        }
        if self.attacker_won.is_some() {
            return None;
        }
        let outcome = self.outcome(attacker_won)?;
        self.attacker_won = Some(attacker_won);
        Some(outcome)
    }

    /// Start the next round locally. Returns the `fists_reset` to relay.
    pub fn reset(&mut self) -> PeerMessage {
        let epoch = self.epoch.next();
        self.start_epoch(epoch);
        PeerMessage::FistsReset { epoch }
    }

    /// Handle a `fists_reset`. True if local state moved to the new round.
    pub fn on_remote_reset(&mut self, epoch: Epoch) -> bool {
        if epoch <= self.epoch {
            return false;
        }
        self.start_epoch(epoch);
        true
    }

    /// The pending local submission again, for after a reconnect.
    pub fn resubmit(&self) -> Option<PeerMessage> {
        self.local.as_ref().map(|s| s.to_message(self.epoch))
    }

    fn start_epoch(&mut self, epoch: Epoch) {
        *self = Self {
            epoch,
            ..Self::default()
        };
    }

    fn try_resolve(&mut self) -> Option<Matchup> {
        let (local, remote) = (self.local.as_ref()?, self.remote.as_ref()?);
        let local_role = assign_roles(local, remote).ok()?;
        let (attacker, defender) = match local_role {
            CombatRole::Attacking => (local.clone(), remote.clone()),
            CombatRole::Defending => (remote.clone(), local.clone()),
        };
        let matchup = Matchup {
            epoch: self.epoch,
            local_role,
            final_blows: matches!(defender, Submission::FinalBlows { .. }),
            attacker,
            defender,
        };
        debug!(epoch = ?self.epoch, role = ?local_role, "combat round resolved");
        self.matchup = Some(matchup.clone());
        Some(matchup)
    }

    fn outcome(&self, attacker_won: bool) -> Option<Outcome> {
        let local = self.local.clone()?;
        let (local_role, final_blows) = match &self.matchup {
            Some(m) => (m.local_role, m.final_blows),
            None => (
                local.declared_role(),
                matches!(local, Submission::FinalBlows { .. }),
            ),
        };
        Some(Outcome {
            epoch: self.epoch,
            attacker_won,
            local_role,
            local,
            final_blows,
        })
    }
}

/// The local player's role given both submissions, or the role both sides
/// are fighting over.
fn assign_roles(local: &Submission, remote: &Submission) -> Result<CombatRole, CombatRole> {
    use Submission::*;
    match (local, remote) {
        (FinalBlows { .. }, FinalBlows { .. }) => Err(CombatRole::Defending),
        (FinalBlows { .. }, Fists(_)) => Ok(CombatRole::Defending),
        (Fists(_), FinalBlows { .. }) => Ok(CombatRole::Attacking),
        (Fists(l), Fists(r)) if l.role == r.role => Err(l.role),
        (Fists(l), Fists(_)) => Ok(l.role),
    }
}

/// `won` is the answer to "did you win?".
pub fn derive_attacker_won(local_role: CombatRole, won: bool) -> bool {
    match local_role {
        CombatRole::Attacking => won,
        CombatRole::Defending => !won,
    }
}
