// Test-only game client for multiplayer integration tests.
//
// Wraps a real `SessionManager` (from `kipukas_session::manager`) over an
// in-memory store and a recording rules engine, and adds synchronous,
// test-friendly helpers around its non-blocking `poll()`:
// create → join → peer_joined → handshake → combat → outcome.
//
// The only test-specific code here is the bounded polling loops and the
// recording rules engine. Transport, relay, combat and CRDT sync use the
// same code paths as a real client.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use kipukas_protocol::types::RoomCode;
use kipukas_session::manager::{SessionEvent, SessionManager};
use kipukas_session::rules::{Matchup, Outcome, RulesEngine};
use kipukas_session::store::MemoryStore;
use kipukas_session::transport::{ClientConfig, ReconnectPolicy};

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Rules engine that remembers what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingRules {
    pub resolved: Vec<Matchup>,
    pub applied: Vec<Outcome>,
}

impl RulesEngine for RecordingRules {
    fn resolve(&mut self, matchup: &Matchup) -> serde_json::Value {
        self.resolved.push(matchup.clone());
        serde_json::json!({ "attacker": matchup.attacker.card() })
    }

    fn apply_outcome(&mut self, outcome: &Outcome) {
        self.applied.push(outcome.clone());
    }
}

/// Client settings for tests: quick retries, small budget.
pub fn test_client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        relay_url: format!("ws://{addr}/"),
        connect_timeout: Duration::from_millis(500),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(200),
            max_attempts: 3,
            jitter: 0.0,
        },
    }
}

/// A test client: one `SessionManager` plus every event it has produced.
pub struct TestPeer {
    pub manager: SessionManager<MemoryStore, RecordingRules>,
    pub store: MemoryStore,
    /// Events seen so far, in order.
    pub events: Vec<SessionEvent>,
    /// Index into `events` of the first one not yet consumed by `wait_for`.
    cursor: usize,
}

impl TestPeer {
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_store(addr, MemoryStore::new())
    }

    /// A client over an existing store, as after a page reload.
    pub fn with_store(addr: SocketAddr, store: MemoryStore) -> Self {
        let manager =
            SessionManager::new(test_client_config(addr), store.clone(), RecordingRules::default())
                .expect("SessionManager::new failed");
        Self {
            manager,
            store,
            events: Vec::new(),
            cursor: 0,
        }
    }

    /// Poll once, recording events.
    pub fn pump(&mut self) {
        let events = self.manager.poll(Instant::now());
        self.events.extend(events);
    }

    /// Blocking poll until an unconsumed event matches `pred`. Returns it
    /// and consumes everything up to it.
    pub fn wait_for(&mut self, what: &str, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        let start = Instant::now();
        loop {
            if let Some(offset) = self.events[self.cursor..].iter().position(&pred) {
                let index = self.cursor + offset;
                self.cursor = index + 1;
                return self.events[index].clone();
            }
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for {what}; seen {:?}",
                &self.events[self.cursor..]
            );
            thread::sleep(POLL_INTERVAL);
            self.pump();
        }
    }

    /// Poll for `duration` and return the unconsumed events.
    pub fn settle(&mut self, duration: Duration) -> Vec<SessionEvent> {
        let start = Instant::now();
        while start.elapsed() < duration {
            self.pump();
            thread::sleep(POLL_INTERVAL);
        }
        let rest = self.events[self.cursor..].to_vec();
        self.cursor = self.events.len();
        rest
    }

    /// Blocking poll until `cond` holds on the manager.
    pub fn poll_until(
        &mut self,
        what: &str,
        cond: impl Fn(&SessionManager<MemoryStore, RecordingRules>) -> bool,
    ) {
        let start = Instant::now();
        while !cond(&self.manager) {
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
            thread::sleep(POLL_INTERVAL);
            self.pump();
        }
    }

    /// Create a room and wait for the relay to confirm it.
    pub fn create(&mut self, name: &str) -> RoomCode {
        self.manager
            .create_room(name, Instant::now())
            .expect("create_room failed");
        match self.wait_for("room_created", |e| matches!(e, SessionEvent::RoomReady { .. })) {
            SessionEvent::RoomReady { code, .. } => code,
            _ => unreachable!(),
        }
    }

    /// Join `code` and wait for the relay to confirm it.
    pub fn join(&mut self, code: &RoomCode, name: &str) {
        self.manager
            .join_room(code.as_str(), name, Instant::now())
            .expect("join_room failed");
        self.wait_for("room_joined", |e| matches!(e, SessionEvent::RoomReady { .. }));
    }

    pub fn wait_peer_joined(&mut self) {
        self.wait_for("peer_joined", |e| *e == SessionEvent::PeerJoined);
    }

    pub fn count(&self, pred: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events.iter().filter(|&e| pred(e)).count()
    }
}

/// Two clients paired in one room: `host` created it, `guest` joined.
pub fn pair(host: &mut TestPeer, guest: &mut TestPeer) -> RoomCode {
    let code = host.create("Host");
    guest.join(&code, "Guest");
    host.wait_peer_joined();
    guest.wait_peer_joined();
    code
}
