// End-to-end integration tests for the multiplayer pipeline.
//
// Each test starts a real relay server, connects real `SessionManager`
// instances (via `TestPeer`), and verifies the full path:
// create → join → peer_joined → CRDT handshake → combat → outcome, plus the
// reconnect, reload and give-up paths.
//
// These tests exercise the same code paths as a live client; the only
// test-specific code is the synchronous polling wrappers in `TestPeer`.

use std::time::{Duration, Instant};

use kipukas_protocol::types::{CombatRole, Epoch};
use kipukas_relay::server::{RelayConfig, RelayHandle, start_relay};
use kipukas_session::error::{ProtocolError, SessionError, StateConflict, TransportError};
use kipukas_session::manager::SessionEvent;
use kipukas_session::store::{EPOCH_KEY, SESSION_KEY, SNAPSHOT_KEY, SessionStore};
use multiplayer_tests::{TestPeer, pair};

fn start_test_relay() -> (RelayHandle, std::net::SocketAddr) {
    let config = RelayConfig {
        port: 0,
        grace_period: Duration::from_secs(5),
        ..RelayConfig::default()
    };
    start_relay(config).unwrap()
}

fn names(peer: &TestPeer) -> Vec<String> {
    peer.manager.timers().into_iter().map(|a| a.name).collect()
}

// ---------------------------------------------------------------------------
// Room lifecycle
// ---------------------------------------------------------------------------

#[test]
fn create_and_join_pairs_both_sides() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::new(addr);
    let mut guest = TestPeer::new(addr);

    let code = pair(&mut host, &mut guest);

    assert_eq!(host.manager.room_code(), Some(&code));
    assert_eq!(guest.manager.room_code(), Some(&code));
    assert!(host.manager.is_creator());
    assert!(!guest.manager.is_creator());
    assert!(host.manager.peer_present() && guest.manager.peer_present());
    assert!(host.store.contains(SESSION_KEY));
    assert!(guest.store.contains(SESSION_KEY));
    assert!(matches!(
        &guest.events[0],
        SessionEvent::RoomReady { name, is_creator: false, .. } if name == "Host"
    ));

    handle.stop();
}

#[test]
fn joining_an_unknown_room_is_rejected_and_not_retried() {
    let (handle, addr) = start_test_relay();
    let mut guest = TestPeer::new(addr);

    guest
        .manager
        .join_room("zzzz", "Guest", Instant::now())
        .unwrap();
    let event = guest.wait_for("rejection", |e| matches!(e, SessionEvent::Rejected(_)));
    assert_eq!(
        event,
        SessionEvent::Rejected(ProtocolError::Rejected("room not found".into()))
    );
    assert!(!guest.manager.in_room());
    assert!(!guest.store.contains(SESSION_KEY));

    let later = guest.settle(Duration::from_millis(400));
    assert!(later.is_empty(), "no reconnect after a refusal: {later:?}");
    assert!(!guest.manager.is_connected());

    handle.stop();
}

#[test]
fn invalid_code_is_rejected_locally() {
    let (handle, addr) = start_test_relay();
    let mut guest = TestPeer::new(addr);
    let err = guest
        .manager
        .join_room("AB0I", "Guest", Instant::now())
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Protocol(ProtocolError::InvalidCode(_))
    ));
    assert!(!guest.manager.in_room());
    handle.stop();
}

// ---------------------------------------------------------------------------
// Shared timers
// ---------------------------------------------------------------------------

/// Each side adds a timer before connecting; after the handshake both hold
/// the same ordered list with both timers.
#[test]
fn handshake_merges_independent_local_timers() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::new(addr);
    let mut guest = TestPeer::new(addr);
    host.manager.add_timer(5, "a_timer", "green").unwrap();
    guest.manager.add_timer(3, "b_timer", "blue").unwrap();

    pair(&mut host, &mut guest);
    host.poll_until("host merge", |m| m.timers().len() == 2);
    guest.poll_until("guest merge", |m| m.timers().len() == 2);

    assert_eq!(host.manager.timers(), guest.manager.timers());
    let mut merged = names(&host);
    merged.sort();
    assert_eq!(merged, vec!["a_timer", "b_timer"]);

    // Live updates after the handshake.
    guest.manager.tick_timers().unwrap();
    let ticked = guest.manager.timers();
    assert!(ticked.iter().all(|a| a.remaining < 5));
    host.poll_until("tick", |m| m.timers() == ticked);

    assert!(host.manager.remove_timer(0).unwrap());
    assert!(!host.manager.remove_timer(9).unwrap());
    guest.poll_until("remove", |m| m.timers().len() == 1);
    assert_eq!(host.manager.timers(), guest.manager.timers());

    handle.stop();
}

/// With nobody to receive it, a live update is dropped by the relay; the
/// handshake on pairing delivers the state instead.
#[test]
fn update_sent_while_alone_arrives_via_handshake() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::new(addr);
    let mut guest = TestPeer::new(addr);

    let code = host.create("Host");
    host.manager.add_timer(4, "early", "pink").unwrap();
    host.settle(Duration::from_millis(50));

    guest.join(&code, "Guest");
    guest.wait_peer_joined();
    guest.poll_until("handshake", |m| m.timers().len() == 1);
    assert_eq!(names(&guest), vec!["early"]);
    // Exactly one change: the handshake diff, not a queued broadcast.
    assert_eq!(
        guest.count(|e| matches!(e, SessionEvent::TimersChanged(_))),
        1
    );

    handle.stop();
}

// ---------------------------------------------------------------------------
// Combat
// ---------------------------------------------------------------------------

#[test]
fn combat_round_resolves_and_outcome_is_symmetric() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::new(addr);
    let mut guest = TestPeer::new(addr);
    pair(&mut host, &mut guest);

    let events = host
        .manager
        .submit_fists(CombatRole::Attacking, "brox", 0)
        .unwrap();
    assert!(events.is_empty());
    guest.wait_for("peer ready", |e| *e == SessionEvent::PeerReady);

    let events = guest
        .manager
        .submit_fists(CombatRole::Defending, "tusk", 2)
        .unwrap();
    assert!(matches!(
        &events[..],
        [SessionEvent::CombatResolved { matchup, .. }] if matchup.local_role == CombatRole::Defending
    ));
    let resolved = host.wait_for("resolution", |e| {
        matches!(e, SessionEvent::CombatResolved { .. })
    });
    let SessionEvent::CombatResolved { matchup, report } = resolved else {
        unreachable!();
    };
    assert_eq!(matchup.local_role, CombatRole::Attacking);
    assert_eq!(matchup.defender.card(), "tusk");
    assert_eq!(report, serde_json::json!({ "attacker": "brox" }));

    // The attacker answers "yes, I won".
    let events = host.manager.report_outcome(true).unwrap();
    assert!(matches!(&events[..], [SessionEvent::OutcomeApplied(o)] if o.attacker_won));
    let applied = guest.wait_for("outcome", |e| {
        matches!(e, SessionEvent::OutcomeApplied(_))
    });
    let SessionEvent::OutcomeApplied(outcome) = applied else {
        unreachable!();
    };
    assert!(outcome.attacker_won);
    assert!(outcome.local_lost());
    assert_eq!(outcome.local.card(), "tusk");

    assert_eq!(host.manager.rules().applied.len(), 1);
    assert_eq!(guest.manager.rules().applied.len(), 1);
    assert!(!host.manager.rules().applied[0].local_lost());

    handle.stop();
}

#[test]
fn same_role_is_a_correctable_conflict() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::new(addr);
    let mut guest = TestPeer::new(addr);
    pair(&mut host, &mut guest);

    host.manager
        .submit_fists(CombatRole::Attacking, "brox", 0)
        .unwrap();
    guest.wait_for("peer ready", |e| *e == SessionEvent::PeerReady);

    let err = guest
        .manager
        .submit_fists(CombatRole::Attacking, "tusk", 0)
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Conflict(StateConflict::SameRole(CombatRole::Attacking))
    ));

    let events = guest
        .manager
        .submit_fists(CombatRole::Defending, "tusk", 0)
        .unwrap();
    assert_eq!(events.len(), 1);
    host.wait_for("resolution", |e| matches!(e, SessionEvent::CombatResolved { .. }));
    // The rejected submission never reached the host.
    assert_eq!(host.count(|e| matches!(e, SessionEvent::RoleConflict(_))), 0);

    handle.stop();
}

#[test]
fn final_blows_makes_the_other_side_attack() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::new(addr);
    let mut guest = TestPeer::new(addr);
    pair(&mut host, &mut guest);

    guest.manager.submit_final_blows("tusk").unwrap();
    host.wait_for("peer ready", |e| *e == SessionEvent::PeerReady);

    // The host picked Defending, but the guest is out of keal means.
    let events = host
        .manager
        .submit_fists(CombatRole::Defending, "brox", 1)
        .unwrap();
    let [SessionEvent::CombatResolved { matchup, .. }] = &events[..] else {
        panic!("expected resolution, got {events:?}");
    };
    assert_eq!(matchup.local_role, CombatRole::Attacking);
    assert!(matchup.final_blows);

    // The Final Blows player answers "no, I lost": the attacker won.
    guest.wait_for("resolution", |e| matches!(e, SessionEvent::CombatResolved { .. }));
    guest.manager.report_outcome(false).unwrap();
    let applied = host.wait_for("outcome", |e| matches!(e, SessionEvent::OutcomeApplied(_)));
    assert!(matches!(applied, SessionEvent::OutcomeApplied(o) if o.attacker_won && o.final_blows));

    handle.stop();
}

#[test]
fn reset_starts_a_new_round_on_both_sides() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::new(addr);
    let mut guest = TestPeer::new(addr);
    pair(&mut host, &mut guest);

    host.manager
        .submit_fists(CombatRole::Attacking, "brox", 0)
        .unwrap();
    guest.wait_for("peer ready", |e| *e == SessionEvent::PeerReady);

    assert_eq!(host.manager.reset_combat().unwrap(), Epoch(1));
    guest.wait_for("reset", |e| {
        *e == SessionEvent::CombatReset { epoch: Epoch(1) }
    });
    let combat = guest.manager.combat().unwrap();
    assert!(combat.remote().is_none());
    assert_eq!(combat.epoch(), Epoch(1));

    // The old submission is gone: the guest's choice waits for a new one.
    let events = guest
        .manager
        .submit_fists(CombatRole::Defending, "tusk", 0)
        .unwrap();
    assert!(events.is_empty());
    host.wait_for("peer ready", |e| *e == SessionEvent::PeerReady);

    handle.stop();
}

// ---------------------------------------------------------------------------
// Reconnects
// ---------------------------------------------------------------------------

/// A dropped connection rejoins within the grace period; the host sees a
/// single peer_left/peer_joined pair and the shared timers survive.
#[test]
fn dropped_connection_rejoins_within_grace_period() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::new(addr);
    let mut guest = TestPeer::new(addr);
    let code = pair(&mut host, &mut guest);
    host.manager.add_timer(6, "shared", "yellow").unwrap();
    guest.poll_until("timer", |m| m.timers().len() == 1);

    guest.manager.drop_connection(Instant::now());
    guest.wait_for("disconnect", |e| *e == SessionEvent::Disconnected);
    let rejoined = guest.wait_for("rejoin", |e| matches!(e, SessionEvent::Rejoined { .. }));
    assert_eq!(rejoined, SessionEvent::Rejoined { code: code.clone() });
    guest.wait_peer_joined();

    host.wait_for("peer left", |e| *e == SessionEvent::PeerLeft);
    host.wait_peer_joined();
    host.settle(Duration::from_millis(300));
    assert_eq!(host.count(|e| *e == SessionEvent::PeerLeft), 1);
    // One from the first pairing, one from the rejoin.
    assert_eq!(host.count(|e| *e == SessionEvent::PeerJoined), 2);

    assert_eq!(guest.manager.room_code(), Some(&code));
    assert_eq!(names(&guest), vec!["shared"]);
    host.manager.tick_timers().unwrap();
    guest.poll_until("tick after rejoin", |m| m.timers()[0].remaining == 5);

    handle.stop();
}

/// A pending combat submission is re-sent after a reconnect.
#[test]
fn pending_submission_is_resent_after_rejoin() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::new(addr);
    let mut guest = TestPeer::new(addr);
    pair(&mut host, &mut guest);

    guest.manager.drop_connection(Instant::now());
    guest.wait_for("disconnect", |e| *e == SessionEvent::Disconnected);
    // Submitted while offline: nothing goes out yet.
    guest
        .manager
        .submit_fists(CombatRole::Defending, "tusk", 0)
        .unwrap();

    guest.wait_for("rejoin", |e| matches!(e, SessionEvent::Rejoined { .. }));
    host.wait_for("peer ready", |e| *e == SessionEvent::PeerReady);

    handle.stop();
}

/// A reloaded client (new manager over the same store) resumes the stored
/// room from its snapshot instead of re-seeding. The old page's socket is
/// still open at the relay when the reload rejoins, as after a phone wakes.
#[test]
fn reload_resumes_stored_room() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::new(addr);
    let mut guest = TestPeer::new(addr);
    guest.manager.add_timer(2, "guest_timer", "red").unwrap();
    let code = pair(&mut host, &mut guest);
    guest.poll_until("merge", |m| m.timers().len() == 1);
    assert!(guest.store.contains(SNAPSHOT_KEY));

    // The old client is never polled again; its socket stays up.
    let stale = guest;
    let mut reloaded = TestPeer::with_store(addr, stale.store.clone());
    assert!(reloaded.manager.resume(Instant::now()).unwrap());
    let event = reloaded.wait_for("rejoin", |e| matches!(e, SessionEvent::Rejoined { .. }));
    assert_eq!(event, SessionEvent::Rejoined { code: code.clone() });
    assert!(!reloaded.manager.is_creator());
    assert!(reloaded.store.contains(SESSION_KEY), "record kept");
    reloaded.wait_peer_joined();
    host.wait_peer_joined();

    // Handshake against the restored document: no duplicate timers.
    reloaded.settle(Duration::from_millis(200));
    assert_eq!(names(&reloaded), vec!["guest_timer"]);
    host.poll_until("host view", |m| m.timers().len() == 1);
    assert_eq!(host.manager.timers(), reloaded.manager.timers());
    assert_eq!(host.count(|e| *e == SessionEvent::PeerLeft), 0);
    assert_eq!(reloaded.manager.room_code(), Some(&code));

    drop(stale);
    handle.stop();
}

/// A reload keeps the combat round number, so the first submission after it
/// reaches the peer.
#[test]
fn reload_keeps_combat_epoch() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::new(addr);
    let mut guest = TestPeer::new(addr);
    pair(&mut host, &mut guest);

    host.manager.reset_combat().unwrap();
    guest.wait_for("reset 1", |e| *e == SessionEvent::CombatReset { epoch: Epoch(1) });
    host.manager.reset_combat().unwrap();
    guest.wait_for("reset 2", |e| *e == SessionEvent::CombatReset { epoch: Epoch(2) });

    let store = guest.store.clone();
    drop(guest);
    let mut reloaded = TestPeer::with_store(addr, store);
    assert!(reloaded.manager.resume(Instant::now()).unwrap());
    reloaded.wait_peer_joined();
    assert_eq!(reloaded.manager.combat().unwrap().epoch(), Epoch(2));

    reloaded
        .manager
        .submit_fists(CombatRole::Defending, "tusk", 0)
        .unwrap();
    host.wait_for("peer ready", |e| *e == SessionEvent::PeerReady);

    handle.stop();
}

/// A client a round behind (no stored epoch) is told the current round when
/// it submits, instead of being ignored.
#[test]
fn stale_submission_is_answered_with_current_round() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::new(addr);
    let mut guest = TestPeer::new(addr);
    pair(&mut host, &mut guest);

    host.manager.reset_combat().unwrap();
    host.manager.reset_combat().unwrap();
    guest.wait_for("reset 2", |e| *e == SessionEvent::CombatReset { epoch: Epoch(2) });

    let mut store = guest.store.clone();
    drop(guest);
    store.remove(EPOCH_KEY).unwrap();
    let mut reloaded = TestPeer::with_store(addr, store);
    assert!(reloaded.manager.resume(Instant::now()).unwrap());
    reloaded.wait_peer_joined();
    assert_eq!(reloaded.manager.combat().unwrap().epoch(), Epoch(0));

    reloaded
        .manager
        .submit_fists(CombatRole::Defending, "tusk", 0)
        .unwrap();
    host.settle(Duration::from_millis(300));
    reloaded.wait_for("caught up", |e| *e == SessionEvent::CombatReset { epoch: Epoch(2) });
    assert_eq!(reloaded.manager.combat().unwrap().epoch(), Epoch(2));
    assert_eq!(host.count(|e| *e == SessionEvent::PeerReady), 0);

    // Submitting again in the right round goes through.
    reloaded
        .manager
        .submit_fists(CombatRole::Defending, "tusk", 0)
        .unwrap();
    host.wait_for("peer ready", |e| *e == SessionEvent::PeerReady);

    handle.stop();
}

/// With the relay gone, reconnect attempts stop after the budget and the
/// failure is surfaced.
#[test]
fn reconnect_gives_up_after_attempt_budget() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::new(addr);
    host.manager.add_timer(3, "kept", "green").unwrap();
    host.create("Host");

    handle.stop();
    host.wait_for("disconnect", |e| *e == SessionEvent::Disconnected);
    let failed = host.wait_for("give up", |e| matches!(e, SessionEvent::ConnectionFailed(_)));
    assert_eq!(
        failed,
        SessionEvent::ConnectionFailed(TransportError::GaveUp { attempts: 3 })
    );
    assert!(!host.manager.in_room());
    assert!(!host.manager.is_reconnecting());
    // Timers fall back to local play; the record remains for a later resume.
    assert_eq!(names(&host), vec!["kept"]);
    assert!(host.store.contains(SESSION_KEY));

    let later = host.settle(Duration::from_millis(500));
    assert!(later.is_empty(), "no attempts after giving up: {later:?}");
}

/// An explicit disconnect clears the stored session and never reconnects.
#[test]
fn explicit_disconnect_never_resumes() {
    let (handle, addr) = start_test_relay();
    let mut host = TestPeer::new(addr);
    let mut guest = TestPeer::new(addr);
    pair(&mut host, &mut guest);
    host.manager.add_timer(8, "keepsake", "pink").unwrap();
    guest.poll_until("timer", |m| m.timers().len() == 1);

    guest.manager.disconnect().unwrap();
    host.wait_for("peer left", |e| *e == SessionEvent::PeerLeft);

    assert!(!guest.store.contains(SESSION_KEY));
    assert!(!guest.store.contains(SNAPSHOT_KEY));
    assert!(!guest.manager.in_room());
    // The shared timers stay with the player as local timers.
    assert_eq!(names(&guest), vec!["keepsake"]);

    let later = guest.settle(Duration::from_millis(400));
    assert!(later.is_empty(), "no reconnect after disconnect: {later:?}");
    assert!(!guest.manager.resume(Instant::now()).unwrap());

    handle.stop();
}
