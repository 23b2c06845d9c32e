// Player agent: the participant side of turn arbitration.
//
// The agent holds no game logic. It joins the session's authority, answers
// each turn request by asking its `Decider`, acknowledges every delta, and
// stops when the game ends or the authority is gone. The authority is the
// only judge of legality; the agent just forwards what the decider returns.
//
// Lifecycle:
// - Welcome (first connect or reconnect) → send `Join`. If the authority is
//   not registered yet the hub bounces it (`SendFailed`) and the agent
//   retries with backoff, so players may start before the authority.
// - `TurnRequest` → at most one `Action` per (turn_seq, attempt), sent only if
//   the decider answered before the deadline. A re-sent request with the same
//   attempt (after a rejoin) is not answered twice.
// - `Delta` → `DeltaAck`, always, including re-deliveries.
// - Terminal delta, `JoinRejected`, or authority loss mid-game → finished.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};
use turnhub_prng::HubRng;
use turnhub_protocol::game::{ActionMessage, GameMessage, Outcome, StateDelta, TurnRequest};
use turnhub_protocol::types::{ParticipantId, Role, SessionId, SlotId, TurnSeq};
use turnhub_relay::client::Backoff;

use crate::participant::{HubEvent, Outbox, Participant};
use crate::viewer::{History, HistoryError};

/// What a decider sees when asked to act.
#[derive(Debug)]
pub struct TurnView<'a> {
    pub slot: SlotId,
    pub slot_name: &'a str,
    pub turn_seq: TurnSeq,
    pub attempt: u32,
    pub state: &'a Value,
    pub legal_actions: &'a [Value],
    pub deadline: Instant,
}

/// Chooses an action for a turn. `None` means no action this time.
pub trait Decider {
    fn decide(&mut self, view: &TurnView<'_>) -> Option<Value>;
}

impl<F> Decider for F
where
    F: FnMut(&TurnView<'_>) -> Option<Value>,
{
    fn decide(&mut self, view: &TurnView<'_>) -> Option<Value> {
        self(view)
    }
}

/// Always plays the first legal action.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstLegal;

impl Decider for FirstLegal {
    fn decide(&mut self, view: &TurnView<'_>) -> Option<Value> {
        view.legal_actions.first().cloned()
    }
}

/// Plays a uniformly random legal action.
#[derive(Clone, Debug)]
pub struct RandomLegal {
    rng: HubRng,
}

impl RandomLegal {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: HubRng::new(seed),
        }
    }
}

impl Decider for RandomLegal {
    fn decide(&mut self, view: &TurnView<'_>) -> Option<Value> {
        self.rng.choose(view.legal_actions).cloned()
    }
}

/// Why a player stopped.
#[derive(Clone, Debug, PartialEq)]
pub enum PlayerExit {
    /// The game ended. `None` only if the terminal delta carried no outcome.
    Finished(Option<Outcome>),
    Rejected(String),
    AuthorityLost,
}

pub struct PlayerAgent<D> {
    id: ParticipantId,
    session_id: SessionId,
    authority: ParticipantId,
    decider: D,
    slot: Option<(SlotId, String)>,
    last_answered: Option<(TurnSeq, u32)>,
    history: History,
    join_backoff: Backoff,
    join_retry_at: Option<Instant>,
    exit: Option<PlayerExit>,
}

impl<D: Decider> PlayerAgent<D> {
    pub fn new(
        id: ParticipantId,
        session_id: SessionId,
        authority: ParticipantId,
        decider: D,
    ) -> Self {
        Self {
            id,
            history: History::new(session_id.clone()),
            session_id,
            authority,
            decider,
            slot: None,
            last_answered: None,
            join_backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(2), 2),
            join_retry_at: None,
            exit: None,
        }
    }

    pub fn with_join_backoff(mut self, backoff: Backoff) -> Self {
        self.join_backoff = backoff;
        self
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn slot(&self) -> Option<SlotId> {
        self.slot.as_ref().map(|(slot, _)| *slot)
    }

    pub fn exit(&self) -> Option<&PlayerExit> {
        self.exit.as_ref()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    fn send_join(&mut self, out: &mut Outbox) {
        out.send(
            &self.authority,
            GameMessage::Join {
                session_id: self.session_id.clone(),
            },
        );
    }

    fn finish(&mut self, exit: PlayerExit) {
        if self.exit.is_none() {
            info!(participant = %self.id, ?exit, "player finished");
            self.exit = Some(exit);
        }
    }

    fn on_turn_request(&mut self, req: TurnRequest, now: Instant, out: &mut Outbox) {
        if !req.targets.contains(&self.id) {
            return;
        }
        let Some((slot, slot_name)) = self.slot.clone() else {
            debug!(participant = %self.id, turn = %req.turn_seq, "turn request before join accepted");
            return;
        };
        if self
            .last_answered
            .is_some_and(|answered| answered >= (req.turn_seq, req.attempt))
        {
            debug!(participant = %self.id, turn = %req.turn_seq, attempt = req.attempt, "already answered");
            return;
        }

        let deadline = now + Duration::from_millis(req.timeout_ms);
        let view = TurnView {
            slot,
            slot_name: &slot_name,
            turn_seq: req.turn_seq,
            attempt: req.attempt,
            state: &req.state,
            legal_actions: &req.legal_actions,
            deadline,
        };
        let Some(payload) = self.decider.decide(&view) else {
            debug!(participant = %self.id, turn = %req.turn_seq, "decider passed");
            return;
        };
        if Instant::now() >= deadline {
            warn!(participant = %self.id, turn = %req.turn_seq, "decision came after the deadline");
            return;
        }

        self.last_answered = Some((req.turn_seq, req.attempt));
        out.send(
            &self.authority,
            GameMessage::Action(ActionMessage {
                session_id: self.session_id.clone(),
                from: self.id.clone(),
                turn_seq: req.turn_seq,
                payload,
            }),
        );
    }

    fn on_delta(&mut self, delta: StateDelta, out: &mut Outbox) {
        out.send(
            &self.authority,
            GameMessage::DeltaAck {
                session_id: self.session_id.clone(),
                turn_seq: delta.turn_seq,
            },
        );
        let terminal = delta.terminal;
        let outcome = delta.outcome.clone();
        match self.history.push(delta.clone()) {
            Ok(_) => {}
            Err(HistoryError::Gap { expected, got }) => {
                // Restarted mid-game; the local log starts over from here.
                debug!(participant = %self.id, %expected, %got, "delta gap, resetting local history");
                self.history = History::resume_from(delta);
            }
            Err(e) => debug!(participant = %self.id, error = %e, "ignoring delta"),
        }
        if terminal {
            self.finish(PlayerExit::Finished(outcome));
        }
    }
}

impl<D: Decider> Participant for PlayerAgent<D> {
    fn role(&self) -> Role {
        Role::Player
    }

    fn on_event(&mut self, event: HubEvent, now: Instant, out: &mut Outbox) {
        if self.exit.is_some() {
            return;
        }
        match event {
            HubEvent::Welcome { .. } => {
                self.join_retry_at = None;
                self.send_join(out);
            }
            HubEvent::SendFailed { to } if to == self.authority => {
                if self.slot.is_some() {
                    self.finish(PlayerExit::AuthorityLost);
                } else {
                    let delay = self.join_backoff.next_delay();
                    debug!(participant = %self.id, ?delay, "authority not registered yet");
                    self.join_retry_at = Some(now + delay);
                }
            }
            HubEvent::Left { id, reason } if id == self.authority => {
                if self.slot.is_some() {
                    warn!(participant = %self.id, ?reason, "authority left mid-game");
                    self.finish(PlayerExit::AuthorityLost);
                }
            }
            HubEvent::Message { from, message } if from == self.authority => {
                if message.session_id() != &self.session_id {
                    debug!(participant = %self.id, "ignoring message for another session");
                    return;
                }
                match message {
                    GameMessage::JoinAccepted {
                        slot, slot_name, ..
                    } => {
                        info!(participant = %self.id, %slot_name, slot = slot.0, "seated");
                        self.join_backoff.reset();
                        self.slot = Some((slot, slot_name));
                    }
                    GameMessage::JoinRejected { reason, .. } => {
                        warn!(participant = %self.id, %reason, "join rejected");
                        self.finish(PlayerExit::Rejected(reason));
                    }
                    GameMessage::TurnRequest(req) => self.on_turn_request(req, now, out),
                    GameMessage::ActionRejected {
                        turn_seq, reason, ..
                    } => {
                        info!(participant = %self.id, turn = %turn_seq, %reason, "action rejected");
                    }
                    GameMessage::Delta(delta) => self.on_delta(delta, out),
                    other => debug!(participant = %self.id, ?other, "player ignoring message"),
                }
            }
            _ => {}
        }
    }

    fn on_tick(&mut self, now: Instant, out: &mut Outbox) {
        if self.exit.is_none() && self.join_retry_at.is_some_and(|at| now >= at) {
            self.join_retry_at = None;
            self.send_join(out);
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.join_retry_at
    }

    fn is_finished(&self) -> bool {
        self.exit.is_some()
    }
}
