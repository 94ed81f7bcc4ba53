// kipukas_session — client side of a two-player Kipukas session.
//
// Everything a game client needs once it talks to the relay: the reconnecting
// transport, the combat round protocol, the shared turn-timer document and
// the storage that lets a session survive a page reload. The relay only
// forwards messages; all agreement between the two players happens here, on
// each client independently.
//
// Module overview:
// - `manager.rs`:   `SessionManager`, the owned session value driven by the
//                   caller's event loop. Routes relay traffic to the
//                   protocols below.
// - `transport.rs`: One relay connection plus backoff-and-retry.
// - `combat.rs`:    Combat round state machine (submit, resolve, outcome,
//                   reset) with epoch tagging.
// - `rules.rs`:     `RulesEngine` seam to the external combat rules.
// - `crdt.rs`:      Shared alarms as a `yrs` document.
// - `sync.rs`:      State-vector handshake and update broadcast over `crdt`.
// - `timers.rs`:    Single-player alarms (seed source and export sink).
// - `store.rs`:     Key/value persistence of the session record and
//                   snapshot.
// - `error.rs`:     Error taxonomy (transport, protocol, state conflict,
//                   codec, store).
//
// Trust model: both players are friends at the same table. Outcomes are
// self-reported and not verified by the other side.

pub mod combat;
pub mod crdt;
pub mod error;
pub mod manager;
pub mod rules;
pub mod store;
pub mod sync;
pub mod timers;
pub mod transport;

pub use combat::{CombatPhase, CombatSession, Submission};
pub use error::{CodecError, ProtocolError, SessionError, StateConflict, StoreError, TransportError};
pub use manager::{SessionEvent, SessionManager};
pub use rules::{Matchup, NullRules, Outcome, RulesEngine};
pub use store::{FileStore, MemoryStore, SessionRecord, SessionStore};
pub use timers::{Alarm, LocalTimers};
pub use transport::{ClientConfig, ReconnectPolicy, Transport, TransportEvent};
