// kipukas_protocol — wire protocol for the Kipukas multiplayer relay.
//
// This crate defines the message types and framing used by the relay
// (`kipukas_relay`) and game clients (`kipukas_session`) to talk over a
// WebSocket. It is shared between both sides and knows nothing about rooms,
// reconnects, or game rules.
//
// Module overview:
// - `types.rs`:    ID types: `RoomCode` (with its confusable-free alphabet),
//                  `ConnectionId`, `CombatRole`, `Epoch`.
// - `message.rs`:  Client-to-relay and relay-to-client message enums.
// - `peer.rs`:     Client-to-client payloads carried opaquely in
//                  `relay.data` (combat sync, CRDT handshake/updates).
// - `framing.rs`:  One JSON document per WebSocket text frame, with a size
//                  limit.
//
// Design decisions:
// - **JSON everywhere.** Browser clients speak the same envelopes, so the
//   wire format is internally tagged JSON (`{"type": ..}`).
// - **Opaque relay payloads.** `relay.data` is a `serde_json::Value`; the
//   relay forwards it untouched, which keeps the relay free of game logic.
// - **Binary CRDT data as base64 strings** inside peer messages, so the
//   frame stays a text frame.

pub mod framing;
pub mod message;
pub mod peer;
pub mod types;

pub use framing::{FrameError, MAX_MESSAGE_SIZE, decode_frame, encode_frame};
pub use message::{ClientMessage, ServerMessage};
pub use peer::{FistsSubmission, PeerMessage};
pub use types::{CombatRole, ConnectionId, Epoch, ROOM_CODE_ALPHABET, ROOM_CODE_LEN, RoomCode};

#[cfg(test)]
mod tests {
    use super::*;

    /// A peer message nested in a relay message survives both framing hops
    /// exactly, which is the property the relay's opacity depends on.
    #[test]
    fn peer_message_survives_relay_envelope() {
        let inner = PeerMessage::FistsOutcome {
            epoch: Epoch(7),
            attacker_won: true,
        };
        let outbound = ClientMessage::Relay {
            data: inner.to_data(),
        };
        let frame = encode_frame(&outbound).unwrap();
        let received: ClientMessage = decode_frame(frame).unwrap().unwrap();

        let forwarded = match received {
            ClientMessage::Relay { data } => ServerMessage::Relay { data },
            other => panic!("expected Relay, got {other:?}"),
        };
        let frame = encode_frame(&forwarded).unwrap();
        let delivered: ServerMessage = decode_frame(frame).unwrap().unwrap();
        match delivered {
            ServerMessage::Relay { data } => {
                assert_eq!(PeerMessage::from_data(&data), Some(inner));
            }
            other => panic!("expected Relay, got {other:?}"),
        }
    }
}
