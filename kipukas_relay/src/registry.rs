// Room registry for the relay.
//
// `Registry` is the central data structure that `server.rs` drives. It pairs
// at most two connections per room code, forwards opaque relay payloads
// between them, and owns the grace-period deadlines that keep a room alive
// after a disconnect. All mutation happens through methods called from the
// server's single-threaded event loop, so join/leave transitions are
// serialized without any internal locking.
//
// Per-room lifecycle:
//
//   Empty → Created (1 peer) → Paired (2 peers) → PeerLeft (timer running)
//                                   ↑                    │
//                                   └── rejoin / join ───┤
//                                                        └→ Destroyed (expired, 0 peers)
//
// Key responsibilities:
// - Room management: create with a fresh confusable-free code, join by code,
//   rejoin (recreating the room if it is gone), typed errors instead of
//   panics for every bad request.
// - Relay: forward `data` verbatim to the other occupant. With no other
//   occupant the payload is dropped, never queued.
// - Seat takeover: a rejoin that names its seat replaces whatever connection
//   still holds that seat. A phone waking from sleep reconnects long before
//   the relay notices its old socket is dead.
// - Grace timers: a disconnect stamps `grace_deadline`; a rejoin clears it;
//   `expire` (called by the event loop) destroys rooms whose deadline passed
//   and that are still empty at that moment.
//
// Writing to clients: each registered connection has an `mpsc::Sender` into
// its socket thread (see `socket.rs`). A send failure means the socket
// thread already exited; its `Disconnected` event will arrive shortly.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use kipukas_protocol::message::ServerMessage;
pub use kipukas_protocol::types::Seat;
use kipukas_protocol::types::{ConnectionId, ROOM_CODE_ALPHABET, ROOM_CODE_LEN, RoomCode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Maximum number of connections sharing one room.
pub const ROOM_CAPACITY: usize = 2;

/// Attempts at drawing an unused room code before giving up.
const CODE_ATTEMPTS: usize = 64;

/// Request failures. The `Display` text is what the client sees in
/// `error.message`.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("room not found")]
    NotFound,
    #[error("room is full")]
    Full,
    #[error("already in a room")]
    AlreadyInRoom,
    #[error("not in a room")]
    NotInRoom,
    #[error("invalid room code")]
    InvalidCode,
    #[error("no free room codes")]
    NoFreeCode,
}

struct Room {
    name: String,
    occupants: Vec<(ConnectionId, Seat)>,
    created_at: Instant,
    grace_deadline: Option<Instant>,
}

impl Room {
    fn other(&self, conn: ConnectionId) -> Option<ConnectionId> {
        self.occupants
            .iter()
            .map(|(id, _)| *id)
            .find(|id| *id != conn)
    }

    fn free_seat(&self) -> Seat {
        if self.occupants.iter().any(|(_, s)| *s == Seat::Creator) {
            Seat::Joiner
        } else {
            Seat::Creator
        }
    }
}

struct Connection {
    outbox: Sender<ServerMessage>,
    room: Option<RoomCode>,
}

/// The relay's room table. Owned by exactly one thread.
pub struct Registry {
    rooms: BTreeMap<RoomCode, Room>,
    connections: HashMap<ConnectionId, Connection>,
    grace_period: Duration,
    rng: StdRng,
}

impl Registry {
    pub fn new(grace_period: Duration) -> Self {
        Self::with_rng(grace_period, StdRng::from_entropy())
    }

    /// Construct with a caller-supplied RNG (deterministic codes in tests).
    pub fn with_rng(grace_period: Duration, rng: StdRng) -> Self {
        Self {
            rooms: BTreeMap::new(),
            connections: HashMap::new(),
            grace_period,
            rng,
        }
    }

    /// Track a newly accepted connection.
    pub fn register(&mut self, conn: ConnectionId, outbox: Sender<ServerMessage>) {
        self.connections.insert(conn, Connection { outbox, room: None });
    }

    /// Open a room with a freshly drawn code and seat `conn` as its creator.
    pub fn create(
        &mut self,
        conn: ConnectionId,
        name: String,
        now: Instant,
    ) -> Result<RoomCode, RegistryError> {
        self.ensure_roomless(conn)?;
        let code = self.draw_code()?;
        self.rooms.insert(
            code.clone(),
            Room {
                name: name.clone(),
                occupants: vec![(conn, Seat::Creator)],
                created_at: now,
                grace_deadline: None,
            },
        );
        self.set_room(conn, Some(code.clone()));
        info!(%conn, %code, "room created");
        self.send_to(
            conn,
            &ServerMessage::RoomCreated {
                code: code.clone(),
                name,
            },
        );
        Ok(code)
    }

    /// Seat `conn` in an existing room. The room must exist and have a free
    /// seat. A non-empty `name` does not rename the room.
    pub fn join(
        &mut self,
        conn: ConnectionId,
        code: &str,
        name: &str,
    ) -> Result<RoomCode, RegistryError> {
        let code = RoomCode::parse(code).ok_or(RegistryError::InvalidCode)?;
        self.ensure_roomless(conn)?;
        let room = self.rooms.get(&code).ok_or(RegistryError::NotFound)?;
        if room.occupants.len() >= ROOM_CAPACITY {
            return Err(RegistryError::Full);
        }
        debug!(%conn, %code, joiner = name, "join accepted");
        self.seat(conn, &code, None);
        Ok(code)
    }

    /// Like `join`, for a client coming back after a reconnect: an unknown
    /// code recreates the room, and any pending eviction is cancelled. A
    /// claimed `seat` still held by another connection is taken over; that
    /// connection is dropped without a `peer_left`.
    pub fn rejoin(
        &mut self,
        conn: ConnectionId,
        code: &str,
        seat: Option<Seat>,
        now: Instant,
    ) -> Result<RoomCode, RegistryError> {
        let code = RoomCode::parse(code).ok_or(RegistryError::InvalidCode)?;
        self.ensure_roomless(conn)?;
        match self.rooms.get(&code) {
            Some(room) => {
                let full = room.occupants.len() >= ROOM_CAPACITY;
                let stale = seat.and_then(|claimed| {
                    room.occupants
                        .iter()
                        .find(|(_, held)| *held == claimed)
                        .map(|(id, _)| *id)
                });
                match stale {
                    Some(old) => self.evict(old, &code),
                    None if full => return Err(RegistryError::Full),
                    None => {}
                }
            }
            None => {
                info!(%conn, %code, "rejoin recreated room");
                self.rooms.insert(
                    code.clone(),
                    Room {
                        name: String::new(),
                        occupants: Vec::new(),
                        created_at: now,
                        grace_deadline: None,
                    },
                );
            }
        }
        self.seat(conn, &code, seat);
        Ok(code)
    }

    /// Forward `data` to the other occupant of `conn`'s room. Returns whether
    /// it was delivered; with nobody to receive it the payload is dropped.
    pub fn relay(
        &mut self,
        conn: ConnectionId,
        data: serde_json::Value,
    ) -> Result<bool, RegistryError> {
        let code = self.room_of(conn).ok_or(RegistryError::NotInRoom)?;
        let other = self.rooms.get(&code).and_then(|room| room.other(conn));
        match other {
            Some(peer) => {
                self.send_to(peer, &ServerMessage::Relay { data });
                Ok(true)
            }
            None => {
                debug!(%conn, %code, "relay dropped: no peer present");
                Ok(false)
            }
        }
    }

    /// `conn` left its room on purpose but keeps its connection.
    pub fn leave(&mut self, conn: ConnectionId, now: Instant) -> Result<(), RegistryError> {
        let code = self.room_of(conn).ok_or(RegistryError::NotInRoom)?;
        self.vacate(conn, &code, now);
        self.set_room(conn, None);
        Ok(())
    }

    /// The connection closed. Frees its seat, tells the peer, and starts the
    /// room's grace timer.
    pub fn disconnect(&mut self, conn: ConnectionId, now: Instant) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        if let Some(code) = connection.room {
            self.vacate(conn, &code, now);
        }
    }

    /// Destroy rooms whose grace deadline has passed. A room that regained an
    /// occupant since the timer started only has its deadline cleared.
    /// Returns the destroyed codes.
    pub fn expire(&mut self, now: Instant) -> Vec<RoomCode> {
        let due: Vec<RoomCode> = self
            .rooms
            .iter()
            .filter(|(_, room)| room.grace_deadline.is_some_and(|d| d <= now))
            .map(|(code, _)| code.clone())
            .collect();

        let mut destroyed = Vec::new();
        for code in due {
            let Some(room) = self.rooms.get_mut(&code) else {
                continue;
            };
            room.grace_deadline = None;
            if room.occupants.is_empty() {
                let age = now.saturating_duration_since(room.created_at);
                self.rooms.remove(&code);
                info!(%code, age_secs = age.as_secs(), "room destroyed after grace period");
                destroyed.push(code);
            } else {
                debug!(%code, "grace period ended with a peer present; room kept");
            }
        }
        destroyed
    }

    /// Earliest pending grace deadline, for the event loop's timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.rooms.values().filter_map(|r| r.grace_deadline).min()
    }

    /// Tell `conn` its request failed.
    pub fn reject(&mut self, conn: ConnectionId, error: &RegistryError) {
        warn!(%conn, %error, "request rejected");
        self.send_to(
            conn,
            &ServerMessage::Error {
                message: error.to_string(),
            },
        );
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of connections seated in `code`, or `None` if there is no
    /// such room.
    pub fn peer_count(&self, code: &RoomCode) -> Option<usize> {
        self.rooms.get(code).map(|r| r.occupants.len())
    }

    pub fn has_pending_eviction(&self, code: &RoomCode) -> bool {
        self.rooms
            .get(code)
            .is_some_and(|r| r.grace_deadline.is_some())
    }

    pub fn room_of(&self, conn: ConnectionId) -> Option<RoomCode> {
        self.connections.get(&conn).and_then(|c| c.room.clone())
    }

    /// Seat assignment of `conn` in its current room.
    pub fn seat_of(&self, conn: ConnectionId) -> Option<Seat> {
        let code = self.room_of(conn)?;
        self.rooms
            .get(&code)?
            .occupants
            .iter()
            .find(|(id, _)| *id == conn)
            .map(|(_, seat)| *seat)
    }

    // -- internals --

    fn ensure_roomless(&self, conn: ConnectionId) -> Result<(), RegistryError> {
        if self.room_of(conn).is_some() {
            Err(RegistryError::AlreadyInRoom)
        } else {
            Ok(())
        }
    }

    /// Put `conn` in a free seat of an existing room (`preferred` if it is
    /// free), cancel its eviction, and announce. Caller has checked capacity.
    fn seat(&mut self, conn: ConnectionId, code: &RoomCode, preferred: Option<Seat>) {
        let Some(room) = self.rooms.get_mut(code) else {
            return;
        };
        let seat = preferred
            .filter(|want| !room.occupants.iter().any(|(_, held)| held == want))
            .unwrap_or_else(|| room.free_seat());
        room.occupants.push((conn, seat));
        if room.grace_deadline.take().is_some() {
            debug!(%code, "grace timer cancelled");
        }
        let name = room.name.clone();
        let paired: Vec<ConnectionId> = if room.occupants.len() == ROOM_CAPACITY {
            room.occupants.iter().map(|(id, _)| *id).collect()
        } else {
            Vec::new()
        };

        self.set_room(conn, Some(code.clone()));
        info!(%conn, %code, ?seat, "seated");
        self.send_to(
            conn,
            &ServerMessage::RoomJoined {
                code: code.clone(),
                name,
            },
        );
        for id in paired {
            self.send_to(id, &ServerMessage::PeerJoined);
        }
    }

    /// Drop `old` from the room and forget it. Its outbox goes with it, which
    /// stops its socket thread; the later `disconnect` finds nothing to do.
    fn evict(&mut self, old: ConnectionId, code: &RoomCode) {
        if let Some(room) = self.rooms.get_mut(code) {
            room.occupants.retain(|(id, _)| *id != old);
        }
        self.connections.remove(&old);
        info!(conn = %old, %code, "stale connection replaced by rejoin");
    }

    fn vacate(&mut self, conn: ConnectionId, code: &RoomCode, now: Instant) {
        let Some(room) = self.rooms.get_mut(code) else {
            return;
        };
        room.occupants.retain(|(id, _)| *id != conn);
        room.grace_deadline = Some(now + self.grace_period);
        let remaining: Vec<ConnectionId> = room.occupants.iter().map(|(id, _)| *id).collect();
        info!(
            %conn,
            %code,
            remaining = remaining.len(),
            grace_secs = self.grace_period.as_secs(),
            "peer left"
        );
        for id in remaining {
            self.send_to(id, &ServerMessage::PeerLeft);
        }
    }

    fn set_room(&mut self, conn: ConnectionId, room: Option<RoomCode>) {
        if let Some(c) = self.connections.get_mut(&conn) {
            c.room = room;
        }
    }

    fn draw_code(&mut self) -> Result<RoomCode, RegistryError> {
        for _ in 0..CODE_ATTEMPTS {
            let mut indices = [0usize; ROOM_CODE_LEN];
            for i in &mut indices {
                *i = self.rng.gen_range(0..ROOM_CODE_ALPHABET.len());
            }
            let code = RoomCode::from_alphabet_indices(indices);
            if !self.rooms.contains_key(&code) {
                return Ok(code);
            }
        }
        Err(RegistryError::NoFreeCode)
    }

    /// Send to one connection. Silently ignores a closed outbox (the socket
    /// thread has exited and its `Disconnected` event is on the way).
    fn send_to(&self, conn: ConnectionId, msg: &ServerMessage) {
        if let Some(c) = self.connections.get(&conn) {
            let _ = c.outbox.send(msg.clone());
        }
    }
}
