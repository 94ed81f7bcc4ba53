// The client's session: one owned value per client process.
//
// `SessionManager` holds the transport, the navigation-surviving store, the
// combat round, the shared-timer sync engine, the single-player timers and
// the rules engine. The caller's event loop calls `poll(now)` regularly and
// reacts to the returned `SessionEvent`s; user actions go through the other
// methods. Nothing blocks.
//
// Room lifecycle:
//
//   create_room / join_room / resume
//        │  (seed or restore the shared document, connect)
//        ▼
//   Opened ──→ create | join | rejoin ──→ room_created / room_joined
//        ▲                                   │ (record + snapshot saved)
//        │ reconnect                         ▼
//   Closed ◄──────────────────────────── in room ──peer_joined──→ handshake
//                                            │
//   disconnect(): export timers, clear record + snapshot, leave, close.
//
// Once a room has been confirmed every reconnect sends `rejoin` naming our
// seat, so the relay replaces a socket of ours it hasn't noticed is dead. A
// relay error in answer to an entry request is a protocol error: the stored
// session is cleared and no further reconnect happens.
//
// The combat epoch is persisted next to the snapshot. A peer that still
// sends an older round gets our current `fists_reset` back so it catches up.

use std::time::Instant;

use kipukas_protocol::message::{ClientMessage, ServerMessage};
use kipukas_protocol::peer::{FistsSubmission, PeerMessage};
use kipukas_protocol::types::{CombatRole, Epoch, RoomCode, Seat};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::combat::{CombatSession, RemoteEffect, Submission};
use crate::error::{ProtocolError, SessionError, TransportError};
use crate::rules::{Matchup, Outcome, RulesEngine};
use crate::store::{
    LOCAL_TIMERS_KEY, SNAPSHOT_KEY, SessionRecord, SessionStore, clear_session, load_epoch,
    load_record, save_epoch, save_record,
};
use crate::sync::SyncEngine;
use crate::timers::{Alarm, LocalTimers};
use crate::transport::{ClientConfig, Transport, TransportEvent};

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// The relay confirmed a create or join.
    RoomReady {
        code: RoomCode,
        name: String,
        is_creator: bool,
    },
    /// Back in the room after a reconnect or reload.
    Rejoined { code: RoomCode },
    PeerJoined,
    PeerLeft,
    /// Connection lost; a reconnect is scheduled if the session is still
    /// wanted.
    Disconnected,
    ConnectionFailed(TransportError),
    /// The relay refused the room. The stored session is gone.
    Rejected(ProtocolError),
    /// A relay error outside room entry (for example relaying before the
    /// relay has seated us again).
    RelayError { message: String },
    TimersChanged(Vec<Alarm>),
    /// The peer has locked in its choice.
    PeerReady,
    CombatResolved { matchup: Matchup, report: Value },
    RoleConflict(CombatRole),
    OutcomeApplied(Outcome),
    CombatReset { epoch: Epoch },
}

struct RoomState {
    /// What to send on the first `Opened`. Reconnects after confirmation use
    /// `rejoin` instead.
    entry: ClientMessage,
    display_name: String,
    is_creator: bool,
    /// Set once the relay confirms the room.
    code: Option<RoomCode>,
    awaiting_entry: bool,
    peer_present: bool,
    combat: CombatSession,
    sync: SyncEngine,
}

impl RoomState {
    fn new(entry: ClientMessage, display_name: String, is_creator: bool, sync: SyncEngine) -> Self {
        Self {
            entry,
            display_name,
            is_creator,
            code: None,
            awaiting_entry: false,
            peer_present: false,
            combat: CombatSession::new(),
            sync,
        }
    }

    fn entry_message(&self) -> ClientMessage {
        match &self.code {
            Some(code) => rejoin_message(code, self.is_creator),
            None => self.entry.clone(),
        }
    }
}

pub struct SessionManager<S: SessionStore, R: RulesEngine> {
    transport: Transport,
    store: S,
    rules: R,
    local: LocalTimers,
    room: Option<RoomState>,
}

impl<S: SessionStore, R: RulesEngine> SessionManager<S, R> {
    /// Loads single-player timers from `store`. Does not connect; call
    /// `resume` to return to a stored room.
    pub fn new(config: ClientConfig, store: S, rules: R) -> Result<Self, SessionError> {
        Self::with_transport(Transport::new(config), store, rules)
    }

    pub fn with_transport(transport: Transport, store: S, rules: R) -> Result<Self, SessionError> {
        let local = match store.get(LOCAL_TIMERS_KEY)? {
            Some(json) => LocalTimers::from_json(&json)?,
            None => LocalTimers::new(),
        };
        Ok(Self {
            transport,
            store,
            rules,
            local,
            room: None,
        })
    }

    // -- room lifecycle --

    pub fn create_room(&mut self, name: &str, now: Instant) -> Result<(), SessionError> {
        self.ensure_roomless()?;
        // Seed before anything can reach the peer.
        let sync = SyncEngine::seeded(self.local.alarms());
        let entry = ClientMessage::Create {
            name: name.to_string(),
        };
        self.room = Some(RoomState::new(entry, name.to_string(), true, sync));
        self.transport.connect(now);
        Ok(())
    }

    pub fn join_room(&mut self, code: &str, name: &str, now: Instant) -> Result<(), SessionError> {
        self.ensure_roomless()?;
        let code =
            RoomCode::parse(code).ok_or_else(|| ProtocolError::InvalidCode(code.to_string()))?;
        let sync = SyncEngine::seeded(self.local.alarms());
        let entry = ClientMessage::Join {
            code: code.as_str().to_string(),
            name: name.to_string(),
        };
        self.room = Some(RoomState::new(entry, name.to_string(), false, sync));
        self.transport.connect(now);
        Ok(())
    }

    /// Return to the stored room, if any, from the persisted snapshot.
    /// Returns whether a session was found.
    pub fn resume(&mut self, now: Instant) -> Result<bool, SessionError> {
        self.ensure_roomless()?;
        let Some(record) = load_record(&self.store)? else {
            return Ok(false);
        };
        let snapshot = self.store.get(SNAPSHOT_KEY)?.unwrap_or_default();
        let sync = match SyncEngine::restore(&snapshot) {
            Ok(sync) => sync,
            Err(e) => {
                warn!(error = %e, "stored timer snapshot unreadable, seeding from local timers");
                SyncEngine::seeded(self.local.alarms())
            }
        };
        let epoch = load_epoch(&self.store)?;
        info!(code = %record.room_code, ?epoch, "resuming stored session");
        let entry = rejoin_message(&record.room_code, record.is_creator);
        let mut room = RoomState::new(entry, record.display_name, record.is_creator, sync);
        room.code = Some(record.room_code);
        room.combat = CombatSession::at_epoch(epoch);
        self.room = Some(room);
        self.transport.connect(now);
        Ok(true)
    }

    /// Leave for good: keep the shared timers locally, forget the room, and
    /// stop reconnecting.
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        if let Some(room) = self.room.take() {
            self.local.replace(room.sync.alarms());
            info!(code = ?room.code, "leaving room");
        }
        self.transport.disconnect();
        clear_session(&mut self.store)?;
        self.save_local()
    }

    /// Drop the connection as a network failure would; the reconnect path
    /// takes over.
    pub fn drop_connection(&mut self, now: Instant) {
        self.transport.force_reconnect(now);
    }

    // -- combat --

    pub fn submit_fists(
        &mut self,
        role: CombatRole,
        card: &str,
        keal_index: u8,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        let room = self.room.as_mut().ok_or(ProtocolError::NotInRoom)?;
        let step = room.combat.submit(FistsSubmission {
            role,
            card: card.to_string(),
            keal_index,
        })?;
        send_peer(&self.transport, &step.outbound);
        Ok(step
            .resolved
            .map(|m| resolved_event(&mut self.rules, m))
            .into_iter()
            .collect())
    }

    pub fn submit_final_blows(&mut self, card: &str) -> Result<Vec<SessionEvent>, SessionError> {
        let room = self.room.as_mut().ok_or(ProtocolError::NotInRoom)?;
        let step = room.combat.submit_final_blows(card.to_string())?;
        send_peer(&self.transport, &step.outbound);
        Ok(step
            .resolved
            .map(|m| resolved_event(&mut self.rules, m))
            .into_iter()
            .collect())
    }

    /// Answer "did you win?" for the resolved round.
    pub fn report_outcome(&mut self, won: bool) -> Result<Vec<SessionEvent>, SessionError> {
        let room = self.room.as_mut().ok_or(ProtocolError::NotInRoom)?;
        let step = room.combat.report_outcome(won)?;
        send_peer(&self.transport, &step.outbound);
        Ok(match step.apply {
            Some(outcome) => {
                self.rules.apply_outcome(&outcome);
                vec![SessionEvent::OutcomeApplied(outcome)]
            }
            None => Vec::new(),
        })
    }

    pub fn reset_combat(&mut self) -> Result<Epoch, SessionError> {
        let room = self.room.as_mut().ok_or(ProtocolError::NotInRoom)?;
        let msg = room.combat.reset();
        send_peer(&self.transport, &msg);
        let epoch = room.combat.epoch();
        save_epoch(&mut self.store, epoch)?;
        Ok(epoch)
    }

    // -- timers --

    pub fn add_timer(&mut self, turns: i32, name: &str, color_set: &str) -> Result<(), SessionError> {
        match &mut self.room {
            Some(room) => {
                let msg = room.sync.add(turns, name, color_set);
                send_peer(&self.transport, &msg);
                self.save_shared()
            }
            None => {
                self.local.add(turns, name, color_set);
                self.save_local()
            }
        }
    }

    pub fn tick_timers(&mut self) -> Result<(), SessionError> {
        match &mut self.room {
            Some(room) => {
                if let Some(msg) = room.sync.tick() {
                    send_peer(&self.transport, &msg);
                    self.save_shared()?;
                }
                Ok(())
            }
            None => {
                self.local.tick();
                self.save_local()
            }
        }
    }

    /// Returns false (and sends nothing) if `index` is out of range.
    pub fn remove_timer(&mut self, index: usize) -> Result<bool, SessionError> {
        let removed = match &mut self.room {
            Some(room) => match room.sync.remove(index) {
                Some(msg) => {
                    send_peer(&self.transport, &msg);
                    self.save_shared()?;
                    true
                }
                None => false,
            },
            None => {
                let removed = self.local.remove(index);
                if removed {
                    self.save_local()?;
                }
                removed
            }
        };
        Ok(removed)
    }

    pub fn timers(&self) -> Vec<Alarm> {
        match &self.room {
            Some(room) => room.sync.alarms(),
            None => self.local.alarms().to_vec(),
        }
    }

    // -- accessors --

    pub fn room_code(&self) -> Option<&RoomCode> {
        self.room.as_ref()?.code.as_ref()
    }

    pub fn in_room(&self) -> bool {
        self.room.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.transport.is_desired() && !self.transport.is_connected()
    }

    pub fn peer_present(&self) -> bool {
        self.room.as_ref().is_some_and(|r| r.peer_present)
    }

    pub fn is_creator(&self) -> bool {
        self.room.as_ref().is_some_and(|r| r.is_creator)
    }

    pub fn combat(&self) -> Option<&CombatSession> {
        self.room.as_ref().map(|r| &r.combat)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.transport.next_deadline()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn rules(&self) -> &R {
        &self.rules
    }

    // -- event loop --

    pub fn poll(&mut self, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        for event in self.transport.poll(now) {
            match event {
                TransportEvent::Opened => self.on_opened(),
                TransportEvent::Message(msg) => self.on_server(msg, &mut events),
                TransportEvent::Closed => {
                    if let Some(room) = &mut self.room {
                        room.peer_present = false;
                        room.awaiting_entry = false;
                    }
                    events.push(SessionEvent::Disconnected);
                }
                TransportEvent::GaveUp { attempts } => {
                    // The stored record stays so a later `resume` can retry.
                    if let Some(room) = self.room.take() {
                        self.local.replace(room.sync.alarms());
                        self.log_store_error(Self::save_local);
                    }
                    events.push(SessionEvent::ConnectionFailed(TransportError::GaveUp {
                        attempts,
                    }));
                }
            }
        }
        events
    }

    fn on_opened(&mut self) {
        let Some(room) = &mut self.room else {
            return;
        };
        let entry = room.entry_message();
        debug!(?entry, "sending room entry");
        room.awaiting_entry = true;
        if let Err(e) = self.transport.send(&entry) {
            warn!(error = %e, "room entry not sent");
        }
    }

    fn on_server(&mut self, msg: ServerMessage, events: &mut Vec<SessionEvent>) {
        match msg {
            ServerMessage::RoomCreated { code, name } | ServerMessage::RoomJoined { code, name } => {
                self.on_entered(code, name, events)
            }
            ServerMessage::PeerJoined => {
                let Some(room) = &mut self.room else {
                    return;
                };
                room.peer_present = true;
                if room.is_creator {
                    send_peer(&self.transport, &room.sync.start_handshake());
                }
                if let Some(msg) = room.combat.resubmit() {
                    send_peer(&self.transport, &msg);
                }
                events.push(SessionEvent::PeerJoined);
            }
            ServerMessage::PeerLeft => {
                if let Some(room) = &mut self.room {
                    room.peer_present = false;
                }
                events.push(SessionEvent::PeerLeft);
            }
            ServerMessage::Relay { data } => match PeerMessage::from_data(&data) {
                Some(peer) => self.on_peer(peer, events),
                None => debug!(%data, "unrecognized relay payload ignored"),
            },
            ServerMessage::Error { message } => {
                let awaiting = self.room.as_ref().is_some_and(|r| r.awaiting_entry);
                if awaiting {
                    warn!(%message, "relay refused the room");
                    self.abandon_room();
                    events.push(SessionEvent::Rejected(ProtocolError::Rejected(message)));
                } else {
                    warn!(%message, "relay error");
                    events.push(SessionEvent::RelayError { message });
                }
            }
        }
    }

    fn on_entered(&mut self, code: RoomCode, name: String, events: &mut Vec<SessionEvent>) {
        let Some(room) = &mut self.room else {
            return;
        };
        room.awaiting_entry = false;
        let returning = room.code.is_some();
        room.code = Some(code.clone());
        let record = SessionRecord {
            room_code: code.clone(),
            display_name: room.display_name.clone(),
            is_creator: room.is_creator,
        };
        let is_creator = room.is_creator;
        let epoch = room.combat.epoch();
        if let Err(e) = save_record(&mut self.store, &record) {
            warn!(error = %e, "session record not saved");
        }
        if let Err(e) = save_epoch(&mut self.store, epoch) {
            warn!(error = %e, "combat epoch not persisted");
        }
        self.log_store_error(Self::save_shared);

        if returning {
            info!(%code, "rejoined room");
            events.push(SessionEvent::Rejoined { code });
        } else {
            info!(%code, %name, is_creator, "entered room");
            events.push(SessionEvent::RoomReady {
                code,
                name,
                is_creator,
            });
        }
    }

    fn on_peer(&mut self, msg: PeerMessage, events: &mut Vec<SessionEvent>) {
        let Some(room) = &mut self.room else {
            return;
        };
        let epoch_before = room.combat.epoch();
        match msg {
            PeerMessage::FistsSync { epoch, submission } => {
                let effect = room.combat.on_remote(epoch, Submission::Fists(submission));
                answer_stale(&self.transport, &room.combat, &effect);
                combat_event(&mut self.rules, effect, events);
            }
            PeerMessage::FinalBlowsSync { epoch, card } => {
                let effect = room
                    .combat
                    .on_remote(epoch, Submission::FinalBlows { card });
                answer_stale(&self.transport, &room.combat, &effect);
                combat_event(&mut self.rules, effect, events);
            }
            PeerMessage::FistsReset { epoch } => {
                if room.combat.on_remote_reset(epoch) {
                    debug!(?epoch, "peer reset the combat round");
                    events.push(SessionEvent::CombatReset { epoch });
                }
            }
            PeerMessage::FistsOutcome {
                epoch,
                attacker_won,
            } => {
                if let Some(outcome) = room.combat.on_remote_outcome(epoch, attacker_won) {
                    self.rules.apply_outcome(&outcome);
                    events.push(SessionEvent::OutcomeApplied(outcome));
                }
            }
            PeerMessage::YrsSv { .. } | PeerMessage::YrsSvReply { .. } | PeerMessage::YrsUpdate { .. } => {
                match room.sync.handle(&msg) {
                    Ok(reply) => {
                        for out in &reply.outbound {
                            send_peer(&self.transport, out);
                        }
                        if reply.changed {
                            events.push(SessionEvent::TimersChanged(room.sync.alarms()));
                            self.log_store_error(Self::save_shared);
                        }
                    }
                    Err(e) => warn!(error = %e, "bad crdt message ignored"),
                }
            }
        }

        let epoch = self.room.as_ref().map(|r| r.combat.epoch());
        if let Some(epoch) = epoch.filter(|e| *e != epoch_before) {
            if let Err(e) = save_epoch(&mut self.store, epoch) {
                warn!(error = %e, "combat epoch not persisted");
            }
        }
    }

    /// Forget the room after a refusal. Local timers keep the shared list.
    fn abandon_room(&mut self) {
        if let Some(room) = self.room.take() {
            self.local.replace(room.sync.alarms());
        }
        self.transport.disconnect();
        if let Err(e) = clear_session(&mut self.store) {
            warn!(error = %e, "stored session not cleared");
        }
        self.log_store_error(Self::save_local);
    }

    fn ensure_roomless(&self) -> Result<(), ProtocolError> {
        if self.room.is_some() {
            Err(ProtocolError::AlreadyInRoom)
        } else {
            Ok(())
        }
    }

    /// Persist the shared document and mirror it into the local timers.
    fn save_shared(&mut self) -> Result<(), SessionError> {
        let Some(room) = &self.room else {
            return Ok(());
        };
        self.local.replace(room.sync.alarms());
        self.store.set(SNAPSHOT_KEY, &room.sync.snapshot())?;
        self.save_local()
    }

    fn save_local(&mut self) -> Result<(), SessionError> {
        let json = self.local.to_json()?;
        self.store.set(LOCAL_TIMERS_KEY, &json)?;
        Ok(())
    }

    fn log_store_error(&mut self, save: fn(&mut Self) -> Result<(), SessionError>) {
        if let Err(e) = save(self) {
            warn!(error = %e, "session state not persisted");
        }
    }
}

fn send_peer(transport: &Transport, msg: &PeerMessage) {
    let relay = ClientMessage::Relay {
        data: msg.to_data(),
    };
    if let Err(e) = transport.send(&relay) {
        // Handshake and resubmit on the next pairing cover what was lost.
        debug!(error = %e, "peer message not sent");
    }
}

fn rejoin_message(code: &RoomCode, is_creator: bool) -> ClientMessage {
    ClientMessage::Rejoin {
        code: code.as_str().to_string(),
        seat: Some(Seat::for_creator(is_creator)),
    }
}

/// A submission from a round we've already left: tell the peer which round
/// we're on.
fn answer_stale(transport: &Transport, combat: &CombatSession, effect: &RemoteEffect) {
    if *effect == RemoteEffect::Stale {
        debug!(epoch = ?combat.epoch(), "answering stale submission with the current round");
        send_peer(
            transport,
            &PeerMessage::FistsReset {
                epoch: combat.epoch(),
            },
        );
    }
}

fn resolved_event(rules: &mut impl RulesEngine, matchup: Matchup) -> SessionEvent {
    let report = rules.resolve(&matchup);
    SessionEvent::CombatResolved { matchup, report }
}

fn combat_event(rules: &mut impl RulesEngine, effect: RemoteEffect, events: &mut Vec<SessionEvent>) {
    match effect {
        RemoteEffect::Stale | RemoteEffect::Duplicate => {}
        RemoteEffect::PeerReady => events.push(SessionEvent::PeerReady),
        RemoteEffect::Conflict(role) => events.push(SessionEvent::RoleConflict(role)),
        RemoteEffect::Resolved(matchup) => events.push(resolved_event(rules, matchup)),
    }
}
