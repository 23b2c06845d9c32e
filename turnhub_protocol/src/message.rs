// Hub protocol messages.
//
// Two enums define everything that crosses a participant's TCP connection:
// - `ClientMessage`: participant → hub.
// - `ServerMessage`: hub → participant.
//
// The hub is a relay. `Send` and `Deliver` carry opaque `Vec<u8>` payloads
// that the hub never decodes; participants put JSON-encoded `GameMessage`s
// (see `game.rs`) in them. Everything else here is registry plumbing:
// handshake, lookup, liveness, and roster notifications.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ParticipantId, Role, SessionId};

/// Version sent in `Hello`. The hub rejects any other value.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent by a participant to the hub.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Register (or reconnect) under `participant_id` in `session_id`.
    /// Must be the first message on a connection.
    Hello {
        protocol_version: u32,
        session_id: SessionId,
        participant_id: ParticipantId,
        role: Role,
    },
    /// Relay `payload` to another participant of the same session.
    Send {
        to: ParticipantId,
        payload: Vec<u8>,
    },
    /// Look up a participant of the same session.
    Resolve { id: ParticipantId },
    /// Liveness signal. Any message counts; this one exists for idle peers.
    Heartbeat,
    /// Explicit leave. The registration is removed.
    Goodbye,
}

/// Messages sent by the hub to a participant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake accepted. `redelivered` counts the queued messages that
    /// follow immediately (non-zero only on reconnect).
    Welcome {
        participant_id: ParticipantId,
        session_id: SessionId,
        participants: Vec<ParticipantInfo>,
        redelivered: u32,
    },
    /// Handshake refused. The hub closes the connection afterwards.
    Rejected { reason: RejectReason },
    /// A relayed payload.
    Deliver {
        from: ParticipantId,
        payload: Vec<u8>,
    },
    /// A `Send` could not be routed.
    SendFailed {
        to: ParticipantId,
        reason: SendFailure,
    },
    /// Answer to `Resolve`. `None` means the id is not registered.
    Resolved {
        id: ParticipantId,
        participant: Option<ParticipantInfo>,
    },
    /// Someone registered or reconnected in this session.
    ParticipantJoined { participant: ParticipantInfo },
    /// Someone left or was declared unreachable.
    ParticipantLeft {
        id: ParticipantId,
        reason: LeaveReason,
    },
}

/// Public view of one registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub role: Role,
    /// Peer socket address of the current connection, if connected.
    pub address: Option<String>,
    /// Registration time, milliseconds since the Unix epoch.
    pub joined_at_ms: u64,
    pub connected: bool,
}

/// Why a handshake was refused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    VersionMismatch { expected: u32, got: u32 },
    /// The id is registered and currently connected (or registered with a
    /// different role).
    AlreadyRegistered { id: ParticipantId },
    /// The first message on the connection was not `Hello`.
    ExpectedHello,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::VersionMismatch { expected, got } => {
                write!(f, "protocol version mismatch (expected {expected}, got {got})")
            }
            RejectReason::AlreadyRegistered { id } => write!(f, "{id} is already registered"),
            RejectReason::ExpectedHello => f.write_str("expected Hello as first message"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendFailure {
    UnknownRecipient,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveReason {
    Goodbye,
    Unreachable,
}
