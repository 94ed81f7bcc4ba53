// kipukas_relay — room relay for two-player Kipukas sessions.
//
// The relay is a thin message broker: it pairs at most two WebSocket
// connections under a short room code and forwards opaque `relay` payloads
// between them. It never interprets game state; combat and timer sync run
// entirely on the clients (`kipukas_session`).
//
// Module overview:
// - `registry.rs`: Room table: create/join/rejoin, relay fan-out, peer
//                  notifications, grace-period deadlines. The core data
//                  structure that `server.rs` drives.
// - `server.rs`:   TCP listener, per-connection socket threads, and the main
//                  event loop that owns the `Registry`.
// - `socket.rs`:   The read/write pump shared by server and client threads.
// - `client.rs`:   Single-connection WebSocket client (`RelayClient`).
//
// Dependencies: `kipukas_protocol` (shared message types and framing),
// `tungstenite` for the WebSocket layer. The relay can run as a standalone
// binary (`main.rs`) or be embedded in-process via `start_relay`.

pub mod client;
pub mod registry;
pub mod server;
mod socket;

pub use client::{ClientError, ClientEvent, RelayClient};
pub use registry::{Registry, RegistryError};
pub use server::{RelayConfig, RelayHandle, start_relay};
