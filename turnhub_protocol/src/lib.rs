// turnhub_protocol — wire vocabulary for the turnhub coordination hub.
//
// Shared by the hub (`turnhub_relay`), the authority and player runtime
// (`turnhub_authority`), and any external participant. No dependency on any
// game's rules.
//
// Module overview:
// - `types.rs`:    Identifiers (`SessionId`, `ParticipantId`, `TurnSeq`,
//                  `SlotId`) and the closed `Role` set.
// - `message.rs`:  Hub-level messages (`ClientMessage`, `ServerMessage`):
//                  handshake, relay, lookup, liveness, roster changes.
// - `game.rs`:     Game-level messages (`GameMessage`) carried as opaque hub
//                  payloads: join, turn requests, actions, deltas, snapshots.
// - `framing.rs`:  4-byte big-endian length prefix + JSON payload over any
//                  `Read`/`Write`.
//
// Two layers, one encoding. The hub decodes only `message.rs` types; game
// messages pass through it as `Vec<u8>`, so the hub stays a pure relay and
// can serve any number of concurrent sessions of any game.

pub mod framing;
pub mod game;
pub mod message;
pub mod types;

pub use framing::{MAX_MESSAGE_SIZE, read_message, write_message};
pub use game::{
    ActionMessage, AppliedAction, Ballot, ForfeitCause, GameMessage, Outcome, StateDelta,
    TurnRequest,
};
pub use message::{
    ClientMessage, LeaveReason, PROTOCOL_VERSION, ParticipantInfo, RejectReason, SendFailure,
    ServerMessage,
};
pub use types::{ParticipantId, Role, SessionId, SlotId, TurnSeq};
