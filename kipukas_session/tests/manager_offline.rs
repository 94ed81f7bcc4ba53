// SessionManager behavior that needs no relay: single-player timers,
// persistence through the store, and errors for room-only operations.

use std::net::TcpListener;
use std::time::{Duration, Instant};

use kipukas_protocol::types::{CombatRole, RoomCode};
use kipukas_session::error::{ProtocolError, SessionError, TransportError};
use kipukas_session::manager::{SessionEvent, SessionManager};
use kipukas_session::rules::NullRules;
use kipukas_session::store::{
    LOCAL_TIMERS_KEY, MemoryStore, SESSION_KEY, SessionRecord, SessionStore, save_record,
};
use kipukas_session::transport::{ClientConfig, ReconnectPolicy};

/// Points at a port nothing listens on.
fn offline_config() -> ClientConfig {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    ClientConfig {
        relay_url: format!("ws://127.0.0.1:{port}/"),
        connect_timeout: Duration::from_millis(200),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_attempts: 2,
            jitter: 0.0,
        },
    }
}

fn manager(store: &MemoryStore) -> SessionManager<MemoryStore, NullRules> {
    SessionManager::new(offline_config(), store.clone(), NullRules).unwrap()
}

#[test]
fn local_timers_persist_across_managers() {
    let store = MemoryStore::new();
    let mut m = manager(&store);
    m.add_timer(2, "scout", "blue").unwrap();
    m.add_timer(1, "ambush", "nope").unwrap();
    m.tick_timers().unwrap();
    assert!(store.contains(LOCAL_TIMERS_KEY));

    let reloaded = manager(&store);
    let timers = reloaded.timers();
    assert_eq!(timers.len(), 2);
    assert_eq!(timers[0].remaining, 1);
    assert_eq!(timers[1].color_set, "red");
    assert!(timers[1].is_complete());
}

#[test]
fn remove_out_of_range_is_a_noop() {
    let store = MemoryStore::new();
    let mut m = manager(&store);
    m.add_timer(3, "only", "pink").unwrap();
    assert!(!m.remove_timer(4).unwrap());
    assert!(m.remove_timer(0).unwrap());
    assert!(m.timers().is_empty());
}

#[test]
fn combat_needs_a_room() {
    let store = MemoryStore::new();
    let mut m = manager(&store);
    let err = m
        .submit_fists(CombatRole::Attacking, "brox", 0)
        .unwrap_err();
    assert!(matches!(err, SessionError::Protocol(ProtocolError::NotInRoom)));
    assert!(m.report_outcome(true).is_err());
    assert!(m.reset_combat().is_err());
}

#[test]
fn resume_without_record_does_nothing() {
    let store = MemoryStore::new();
    let mut m = manager(&store);
    assert!(!m.resume(Instant::now()).unwrap());
    assert!(!m.in_room());
    assert!(!m.is_reconnecting());
}

#[test]
fn second_room_is_refused() {
    let store = MemoryStore::new();
    let mut m = manager(&store);
    m.create_room("Host", Instant::now()).unwrap();
    let err = m.join_room("ABCD", "Host", Instant::now()).unwrap_err();
    assert!(matches!(err, SessionError::Protocol(ProtocolError::AlreadyInRoom)));
}

#[test]
fn unreachable_relay_gives_up_and_keeps_record() {
    let mut store = MemoryStore::new();
    save_record(
        &mut store,
        &SessionRecord {
            room_code: RoomCode::parse("ABCD").unwrap(),
            display_name: "Guest".into(),
            is_creator: false,
        },
    )
    .unwrap();
    let mut m = manager(&store);
    assert!(m.resume(Instant::now()).unwrap());

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut failed = None;
    while failed.is_none() && Instant::now() < deadline {
        failed = m
            .poll(Instant::now())
            .into_iter()
            .find(|e| matches!(e, SessionEvent::ConnectionFailed(_)));
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(
        failed,
        Some(SessionEvent::ConnectionFailed(TransportError::GaveUp {
            attempts: 2
        }))
    );
    assert!(!m.in_room());
    assert!(store.get(SESSION_KEY).unwrap().is_some());
}
