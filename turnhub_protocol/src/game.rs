// Game-level messages exchanged between the authority, players, and
// observers through the hub.
//
// These ride inside `ClientMessage::Send` / `ServerMessage::Deliver` payloads,
// JSON-encoded with `GameMessage::encode`. The hub never sees them as anything
// but bytes.
//
// Game state and actions are carried as `serde_json::Value`: the coordination
// core is game-agnostic, and the authority's rule-checker decodes them into
// its own typed state/action.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ParticipantId, SessionId, SlotId, TurnSeq};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GameMessage {
    /// Player → authority: claim a role slot.
    Join { session_id: SessionId },
    /// Authority → player: slot granted (also sent again on rejoin).
    JoinAccepted {
        session_id: SessionId,
        slot: SlotId,
        slot_name: String,
    },
    /// Authority → player: no slot for you.
    JoinRejected {
        session_id: SessionId,
        reason: String,
    },
    TurnRequest(TurnRequest),
    Action(ActionMessage),
    /// Authority → player: the action for `turn_seq` was illegal. A fresh
    /// `TurnRequest` for the same `turn_seq` follows unless the retry budget
    /// is spent.
    ActionRejected {
        session_id: SessionId,
        turn_seq: TurnSeq,
        reason: String,
    },
    Delta(StateDelta),
    /// Player → authority: delta `turn_seq` received.
    DeltaAck {
        session_id: SessionId,
        turn_seq: TurnSeq,
    },
    /// Observer → authority: send me the latest delta.
    SnapshotRequest { session_id: SessionId },
    Snapshot {
        session_id: SessionId,
        latest: Option<StateDelta>,
    },
}

impl GameMessage {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Session this message belongs to.
    pub fn session_id(&self) -> &SessionId {
        match self {
            GameMessage::Join { session_id }
            | GameMessage::JoinAccepted { session_id, .. }
            | GameMessage::JoinRejected { session_id, .. }
            | GameMessage::ActionRejected { session_id, .. }
            | GameMessage::DeltaAck { session_id, .. }
            | GameMessage::SnapshotRequest { session_id }
            | GameMessage::Snapshot { session_id, .. } => session_id,
            GameMessage::TurnRequest(req) => &req.session_id,
            GameMessage::Action(action) => &action.session_id,
            GameMessage::Delta(delta) => &delta.session_id,
        }
    }
}

/// "It is your turn." Addressed to one participant, or to several during a
/// simultaneous phase (each target receives its own copy).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub session_id: SessionId,
    pub turn_seq: TurnSeq,
    /// 0 for the first request of a turn, incremented on each re-request
    /// after an illegal action.
    pub attempt: u32,
    pub targets: Vec<ParticipantId>,
    pub state: Value,
    /// Actions the rule-checker currently allows for the recipient.
    pub legal_actions: Vec<Value>,
    /// Time left to answer, relative to receipt.
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionMessage {
    pub session_id: SessionId,
    pub from: ParticipantId,
    pub turn_seq: TurnSeq,
    pub payload: Value,
}

/// One committed turn. The ordered sequence of deltas is the session history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub session_id: SessionId,
    pub turn_seq: TurnSeq,
    pub applied: AppliedAction,
    pub state: Value,
    pub terminal: bool,
    pub outcome: Option<Outcome>,
}

/// What produced a committed turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AppliedAction {
    /// A submitted action accepted by the rule-checker.
    Move { by: ParticipantId, payload: Value },
    /// A legal action chosen by the authority for a silent player.
    DefaultMove { by: ParticipantId, payload: Value },
    /// The turn was forfeited; state advanced without an action.
    Forfeited {
        by: ParticipantId,
        cause: ForfeitCause,
    },
    /// A simultaneous phase resolved. Missing votes are `None`.
    Joint { ballots: Vec<Ballot> },
    /// The session was stopped before or during this turn.
    Aborted { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub voter: ParticipantId,
    pub choice: Option<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForfeitCause {
    Timeout,
    IllegalRetriesExhausted,
    Unreachable,
}

/// Final result carried by the terminal delta.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Win {
        winners: Vec<ParticipantId>,
        summary: String,
    },
    Draw { summary: String },
    Abandoned { reason: String },
}
