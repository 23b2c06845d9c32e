// The rule-checker seam.
//
// The authority knows nothing about any particular game. Everything
// game-specific comes through `RuleChecker`: the initial state for the seated
// slots, whose turn it is, which actions are legal, how an action changes the
// state, and when the game is over. State and actions are typed here and
// cross the wire as `serde_json::Value`.
//
// A turn is either `Single` (one slot must act) or `Simultaneous` (several
// slots vote; the authority collects ballots until everyone answered or the
// deadline passes, then hands them to `resolve`).

use serde::Serialize;
use serde::de::DeserializeOwned;
use turnhub_protocol::types::{ParticipantId, SlotId};

use crate::tally::TieBreaker;

/// A seated slot, as handed to `initial_state`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: SlotId,
    pub name: String,
    pub holder: ParticipantId,
}

/// Who acts next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Turn {
    Single(SlotId),
    Simultaneous(Vec<SlotId>),
}

/// End of game. Empty `winners` is a draw.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub winners: Vec<SlotId>,
    pub summary: String,
}

impl Verdict {
    pub fn win(winners: Vec<SlotId>, summary: impl Into<String>) -> Self {
        Self {
            winners,
            summary: summary.into(),
        }
    }

    pub fn draw(summary: impl Into<String>) -> Self {
        Self {
            winners: Vec::new(),
            summary: summary.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct IllegalReason(pub String);

impl IllegalReason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// One slot's vote in a simultaneous phase. `None` is an abstention.
#[derive(Clone, Debug, PartialEq)]
pub struct SlotBallot<A> {
    pub slot: SlotId,
    pub choice: Option<A>,
}

pub trait RuleChecker {
    type State: Clone + Serialize;
    type Action: Clone + PartialEq + Serialize + DeserializeOwned;

    fn initial_state(&self, slots: &[SlotInfo]) -> Self::State;

    fn next_turn(&self, state: &Self::State) -> Turn;

    fn legal_actions(&self, state: &Self::State, slot: SlotId) -> Vec<Self::Action>;

    /// Apply `action` by `slot`, or say why it is illegal.
    fn apply(
        &self,
        state: &Self::State,
        slot: SlotId,
        action: &Self::Action,
    ) -> Result<Self::State, IllegalReason>;

    /// Validate a ballot in a simultaneous phase without applying it.
    fn check(
        &self,
        state: &Self::State,
        slot: SlotId,
        action: &Self::Action,
    ) -> Result<(), IllegalReason> {
        self.apply(state, slot, action).map(|_| ())
    }

    /// Combine the ballots of a simultaneous phase into the next state.
    /// Ballots arrive in slot order.
    fn resolve(
        &self,
        state: &Self::State,
        ballots: &[SlotBallot<Self::Action>],
        tie: &mut TieBreaker,
    ) -> Self::State {
        let _ = (ballots, tie);
        state.clone()
    }

    /// Advance past `slot`'s turn without an action.
    fn skip(&self, state: &Self::State, slot: SlotId) -> Self::State;

    fn is_terminal(&self, state: &Self::State) -> Option<Verdict>;

    /// Result when `slot` forfeits the whole game. `None` lets the authority
    /// declare every other slot a winner.
    fn forfeit_verdict(&self, state: &Self::State, slot: SlotId) -> Option<Verdict> {
        let _ = (state, slot);
        None
    }
}
