// The game authority: sole owner of one session's canonical state.
//
// `Authority<R>` is a sans-IO state machine driven by `run_participant` (or
// directly by tests). Phases:
//
//   Forming ──(all slots held)──> AwaitingAction(n) ──(commit)──> Broadcasting(n)
//      │                              │      ^                       │
//      │                              │      └──(all acked / retries spent)
//      └──(forming timeout)──┐        └──(terminal commit)──┐        │
//                            v                              v        v
//                        Terminated <───────────────────────────────┘
//
// Validating and applying happen synchronously inside the handler that
// receives an action, so they never appear as waiting phases.
//
// AwaitingAction(n): a `TurnRequest` went to whoever owes turn `n`, with a
// deadline. An action is accepted only if it carries `turn_seq == n` and
// comes from a slot that owes the turn; anything else is dropped silently
// (stale, duplicate, or post-termination). An illegal action is answered with
// `ActionRejected` and the same turn is re-requested with `attempt + 1`;
// once the illegal-retry budget is spent, or the deadline passes, or the
// owner is reported unreachable, the configured `MissedTurnPolicy` decides
// the turn. Simultaneous turns collect one accepted ballot per voter; missing
// ballots are abstentions and the rule-checker resolves the set.
//
// Commit: the turn gets the next `turn_seq` (0, 1, 2, ... with no gaps), the
// delta is appended to the history and sent to every slot holder and
// observer. Broadcasting(n) then waits for `DeltaAck`s from the present
// holders, re-sending to laggards a bounded number of times, so no one gets
// request n+1 before delta n. A terminal delta (rule-checker verdict, turn
// cap, forfeit, or abort) ends the session instead.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use turnhub_prng::HubRng;
use turnhub_protocol::game::{
    ActionMessage, AppliedAction, Ballot, ForfeitCause, GameMessage, Outcome, StateDelta,
    TurnRequest,
};
use turnhub_protocol::types::{ParticipantId, Role, SlotId, TurnSeq};

use crate::config::{ConfigError, MissedTurnPolicy, SessionConfig};
use crate::participant::{HubEvent, Outbox, Participant};
use crate::rules::{IllegalReason, RuleChecker, SlotBallot, Turn, Verdict};
use crate::session::{JoinError, Joined, Session, SessionStatus};
use crate::tally::TieBreaker;
use crate::viewer::History;

/// Public view of where the turn loop is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthorityPhase {
    Forming,
    AwaitingAction(TurnSeq),
    Broadcasting(TurnSeq),
    Terminated,
}

impl fmt::Display for AuthorityPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorityPhase::Forming => f.write_str("forming"),
            AuthorityPhase::AwaitingAction(n) => write!(f, "awaiting action {n}"),
            AuthorityPhase::Broadcasting(n) => write!(f, "broadcasting {n}"),
            AuthorityPhase::Terminated => f.write_str("terminated"),
        }
    }
}

enum Phase<A> {
    Forming,
    Awaiting(PendingTurn<A>),
    Broadcasting(PendingBroadcast),
    Terminated,
}

struct PendingTurn<A> {
    seq: TurnSeq,
    deadline: Instant,
    kind: PendingKind<A>,
}

enum PendingKind<A> {
    Single { slot: SlotId, attempts: u32 },
    Vote { ballots: BTreeMap<SlotId, Vote<A>> },
}

struct Vote<A> {
    attempts: u32,
    choice: Option<A>,
    closed: bool,
}

impl<A> PendingTurn<A> {
    fn owed_by(&self, slot: SlotId) -> bool {
        match &self.kind {
            PendingKind::Single { slot: owner, .. } => *owner == slot,
            PendingKind::Vote { ballots } => ballots.get(&slot).is_some_and(|v| !v.closed),
        }
    }

    fn attempts_of(&self, slot: SlotId) -> u32 {
        match &self.kind {
            PendingKind::Single { attempts, .. } => *attempts,
            PendingKind::Vote { ballots } => ballots.get(&slot).map_or(0, |v| v.attempts),
        }
    }
}

struct PendingBroadcast {
    seq: TurnSeq,
    awaiting: BTreeSet<ParticipantId>,
    deadline: Instant,
    retries_left: u32,
}

pub struct Authority<R: RuleChecker> {
    id: ParticipantId,
    config: SessionConfig,
    rules: R,
    session: Session,
    state: Option<R::State>,
    phase: Phase<R::Action>,
    next_seq: TurnSeq,
    history: History,
    tie: TieBreaker,
    rng: HubRng,
    forming_deadline: Option<Instant>,
}

impl<R: RuleChecker> Authority<R> {
    pub fn new(config: SessionConfig, rules: R, now: Instant) -> Result<Self, ConfigError> {
        config.validate()?;
        let label = config.session_id.as_str();
        let session = Session::new(
            config.session_id.clone(),
            &config.slots,
            config.slot_assignment,
            HubRng::from_label(&format!("{label}/slots"), config.seed),
        );
        let tie = TieBreaker::new(
            config.tie_break,
            HubRng::from_label(&format!("{label}/ties"), config.seed),
        );
        let rng = HubRng::from_label(&format!("{label}/defaults"), config.seed);
        info!(
            session = %config.session_id,
            authority = %config.authority_id,
            slots = config.slots.len(),
            "session forming"
        );
        Ok(Self {
            id: config.authority_id.clone(),
            history: History::new(config.session_id.clone()),
            forming_deadline: config.forming_timeout().map(|d| now + d),
            session,
            tie,
            rng,
            rules,
            state: None,
            phase: Phase::Forming,
            next_seq: TurnSeq(0),
            config,
        })
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> AuthorityPhase {
        match &self.phase {
            Phase::Forming => AuthorityPhase::Forming,
            Phase::Awaiting(p) => AuthorityPhase::AwaitingAction(p.seq),
            Phase::Broadcasting(b) => AuthorityPhase::Broadcasting(b.seq),
            Phase::Terminated => AuthorityPhase::Terminated,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// `turn_seq` the next committed turn will carry.
    pub fn expected_seq(&self) -> TurnSeq {
        self.next_seq
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn state(&self) -> Option<&R::State> {
        self.state.as_ref()
    }

    /// Stop the session now. Sends a terminal delta with an `Abandoned`
    /// outcome to everyone; later actions are dropped.
    pub fn abort(&mut self, reason: impl Into<String>, now: Instant, out: &mut Outbox) {
        if matches!(self.phase, Phase::Terminated) {
            return;
        }
        let reason = reason.into();
        warn!(session = %self.config.session_id, %reason, "session aborted");
        let delta = StateDelta {
            session_id: self.config.session_id.clone(),
            turn_seq: self.next_seq,
            applied: AppliedAction::Aborted {
                reason: reason.clone(),
            },
            state: self.state.as_ref().map_or(Value::Null, to_json),
            terminal: true,
            outcome: Some(Outcome::Abandoned { reason }),
        };
        self.next_seq = self.next_seq.next();
        self.record_and_broadcast(delta, now, out);
    }

    // --- joining ---

    fn handle_join(&mut self, from: ParticipantId, now: Instant, out: &mut Outbox) {
        match self.session.join(&from) {
            Ok(joined) => {
                let slot = joined.slot();
                let slot_name = self
                    .session
                    .slot(slot)
                    .map(|s| s.name.clone())
                    .unwrap_or_default();
                out.send(
                    &from,
                    GameMessage::JoinAccepted {
                        session_id: self.config.session_id.clone(),
                        slot,
                        slot_name: slot_name.clone(),
                    },
                );
                match joined {
                    Joined::New(_) => {
                        info!(
                            session = %self.config.session_id,
                            participant = %from,
                            %slot_name,
                            filled = self.session.filled(),
                            of = self.session.slot_count(),
                            "player seated"
                        );
                        if self.session.status() == SessionStatus::Forming && self.session.is_full()
                        {
                            self.start(now, out);
                        }
                    }
                    Joined::Rejoined(_) => {
                        self.session.mark_present(&from);
                        info!(session = %self.config.session_id, participant = %from, %slot_name, "player rejoined");
                        self.resend_pending(slot, &from, now, out);
                    }
                }
            }
            Err(e) => {
                info!(session = %self.config.session_id, participant = %from, reason = %e, "join rejected");
                out.send(
                    &from,
                    GameMessage::JoinRejected {
                        session_id: self.config.session_id.clone(),
                        reason: e.to_string(),
                    },
                );
            }
        }
    }

    fn start(&mut self, now: Instant, out: &mut Outbox) {
        let slots = self.session.slot_infos();
        self.state = Some(self.rules.initial_state(&slots));
        self.session.advance(SessionStatus::InProgress);
        info!(session = %self.config.session_id, "session in progress");
        self.begin_turn(now, out);
    }

    /// Bring a rejoining holder back up to date with whatever it owes.
    fn resend_pending(&mut self, slot: SlotId, id: &ParticipantId, now: Instant, out: &mut Outbox) {
        match &self.phase {
            Phase::Awaiting(pending) if pending.owed_by(slot) => {
                let attempt = pending.attempts_of(slot);
                self.send_turn_request(slot, attempt, now, out);
            }
            Phase::Broadcasting(b) if b.awaiting.contains(id) => {
                if let Some(delta) = self.history.latest() {
                    out.send(id, GameMessage::Delta(delta.clone()));
                }
            }
            _ => {}
        }
    }

    // --- turns ---

    fn begin_turn(&mut self, now: Instant, out: &mut Outbox) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        let seq = self.next_seq;
        match self.rules.next_turn(state) {
            Turn::Single(slot) => {
                if self.session.holder(slot).is_none() {
                    self.abort(format!("turn for unseated slot {}", slot.0), now, out);
                    return;
                }
                let deadline = now + self.slot_timeout(slot);
                self.phase = Phase::Awaiting(PendingTurn {
                    seq,
                    deadline,
                    kind: PendingKind::Single { slot, attempts: 0 },
                });
                debug!(session = %self.config.session_id, turn = %seq, slot = slot.0, "awaiting action");
                self.send_turn_request(slot, 0, now, out);
            }
            Turn::Simultaneous(slots) => {
                let timeout = slots
                    .iter()
                    .map(|s| self.slot_timeout(*s))
                    .max()
                    .unwrap_or_else(|| Duration::from_millis(self.config.turn_timeout_ms));
                let ballots = slots
                    .iter()
                    .map(|s| {
                        (
                            *s,
                            Vote {
                                attempts: 0,
                                choice: None,
                                closed: false,
                            },
                        )
                    })
                    .collect();
                self.phase = Phase::Awaiting(PendingTurn {
                    seq,
                    deadline: now + timeout,
                    kind: PendingKind::Vote { ballots },
                });
                debug!(session = %self.config.session_id, turn = %seq, voters = slots.len(), "awaiting votes");
                for slot in &slots {
                    self.send_turn_request(*slot, 0, now, out);
                }
                self.maybe_resolve_votes(now, out);
            }
        }
    }

    fn slot_timeout(&self, slot: SlotId) -> Duration {
        let name = self.session.slot(slot).map_or("", |s| s.name.as_str());
        self.config.timeout_for(name)
    }

    fn send_turn_request(&self, slot: SlotId, attempt: u32, now: Instant, out: &mut Outbox) {
        let (Phase::Awaiting(pending), Some(state)) = (&self.phase, self.state.as_ref()) else {
            return;
        };
        let Some(holder) = self.session.holder(slot) else {
            return;
        };
        let targets = match &pending.kind {
            PendingKind::Single { .. } => vec![holder.clone()],
            PendingKind::Vote { ballots } => ballots
                .keys()
                .filter_map(|s| self.session.holder(*s).cloned())
                .collect(),
        };
        let request = TurnRequest {
            session_id: self.config.session_id.clone(),
            turn_seq: pending.seq,
            attempt,
            targets,
            state: to_json(state),
            legal_actions: self
                .rules
                .legal_actions(state, slot)
                .iter()
                .map(to_json)
                .collect(),
            timeout_ms: millis(pending.deadline.saturating_duration_since(now)),
        };
        out.send(holder, GameMessage::TurnRequest(request));
    }

    fn handle_action(
        &mut self,
        from: ParticipantId,
        action: ActionMessage,
        now: Instant,
        out: &mut Outbox,
    ) {
        let session = &self.config.session_id;
        let (seq, is_vote) = match &self.phase {
            Phase::Awaiting(p) => (p.seq, matches!(p.kind, PendingKind::Vote { .. })),
            Phase::Terminated => {
                debug!(%session, participant = %from, turn = %action.turn_seq, "action after termination");
                return;
            }
            _ => {
                debug!(%session, participant = %from, turn = %action.turn_seq, "no action expected");
                return;
            }
        };
        if action.turn_seq != seq {
            debug!(%session, participant = %from, turn = %action.turn_seq, expected = %seq, "stale or out-of-order action");
            return;
        }
        if action.from != from {
            debug!(%session, participant = %from, claimed = %action.from, "action sender mismatch");
            return;
        }
        let Some(slot) = self.session.slot_of(&from) else {
            debug!(%session, participant = %from, "action from a participant without a slot");
            return;
        };
        let owed = matches!(&self.phase, Phase::Awaiting(p) if p.owed_by(slot));
        if !owed {
            debug!(%session, participant = %from, turn = %seq, "action from a slot that does not owe this turn");
            return;
        }
        let Some(state) = self.state.as_ref() else {
            return;
        };

        let parsed = serde_json::from_value::<R::Action>(action.payload.clone())
            .map_err(|e| IllegalReason::new(format!("malformed action: {e}")));

        if is_vote {
            match parsed.and_then(|a| self.rules.check(state, slot, &a).map(|()| a)) {
                Ok(choice) => {
                    debug!(session = %self.config.session_id, participant = %from, turn = %seq, "ballot accepted");
                    if let Some(vote) = self.ballot_mut(slot) {
                        vote.choice = Some(choice);
                        vote.closed = true;
                    }
                    self.maybe_resolve_votes(now, out);
                }
                Err(reason) => self.reject(slot, &from, seq, reason, now, out),
            }
        } else {
            match parsed.and_then(|a| self.rules.apply(state, slot, &a)) {
                Ok(next) => {
                    info!(session = %self.config.session_id, participant = %from, turn = %seq, "action accepted");
                    self.commit(
                        AppliedAction::Move {
                            by: from,
                            payload: action.payload,
                        },
                        next,
                        None,
                        now,
                        out,
                    );
                }
                Err(reason) => self.reject(slot, &from, seq, reason, now, out),
            }
        }
    }

    fn ballot_mut(&mut self, slot: SlotId) -> Option<&mut Vote<R::Action>> {
        match &mut self.phase {
            Phase::Awaiting(PendingTurn {
                kind: PendingKind::Vote { ballots },
                ..
            }) => ballots.get_mut(&slot),
            _ => None,
        }
    }

    fn reject(
        &mut self,
        slot: SlotId,
        from: &ParticipantId,
        seq: TurnSeq,
        reason: IllegalReason,
        now: Instant,
        out: &mut Outbox,
    ) {
        warn!(session = %self.config.session_id, participant = %from, turn = %seq, %reason, "illegal action");
        out.send(
            from,
            GameMessage::ActionRejected {
                session_id: self.config.session_id.clone(),
                turn_seq: seq,
                reason: reason.to_string(),
            },
        );

        let Phase::Awaiting(pending) = &mut self.phase else {
            return;
        };
        let is_vote = matches!(pending.kind, PendingKind::Vote { .. });
        let attempts = match &mut pending.kind {
            PendingKind::Single { attempts, .. } => {
                *attempts += 1;
                *attempts
            }
            PendingKind::Vote { ballots } => match ballots.get_mut(&slot) {
                Some(vote) => {
                    vote.attempts += 1;
                    vote.attempts
                }
                None => return,
            },
        };

        if attempts < self.config.illegal_retry_budget {
            self.send_turn_request(slot, attempts, now, out);
        } else if is_vote {
            info!(session = %self.config.session_id, participant = %from, turn = %seq, "retry budget spent, ballot counts as abstention");
            if let Some(vote) = self.ballot_mut(slot) {
                vote.closed = true;
            }
            self.maybe_resolve_votes(now, out);
        } else {
            self.miss_turn(slot, ForfeitCause::IllegalRetriesExhausted, now, out);
        }
    }

    /// The owner of a single-slot turn did not complete it.
    fn miss_turn(&mut self, slot: SlotId, cause: ForfeitCause, now: Instant, out: &mut Outbox) {
        let Some(state) = self.state.clone() else {
            return;
        };
        let Some(by) = self.session.holder(slot).cloned() else {
            self.abort(format!("turn for unseated slot {}", slot.0), now, out);
            return;
        };
        let policy = self.config.missed_turn;
        info!(
            session = %self.config.session_id,
            participant = %by,
            turn = %self.next_seq,
            ?cause,
            ?policy,
            "turn missed"
        );

        match policy {
            MissedTurnPolicy::Skip => {
                let next = self.rules.skip(&state, slot);
                self.commit(AppliedAction::Forfeited { by, cause }, next, None, now, out);
            }
            MissedTurnPolicy::RandomLegal => {
                let legal = self.rules.legal_actions(&state, slot);
                let played = self.rng.choose(&legal).cloned().and_then(|action| {
                    match self.rules.apply(&state, slot, &action) {
                        Ok(next) => Some((action, next)),
                        Err(reason) => {
                            warn!(%reason, "rule-checker refused its own legal action");
                            None
                        }
                    }
                });
                match played {
                    Some((action, next)) => self.commit(
                        AppliedAction::DefaultMove {
                            by,
                            payload: to_json(&action),
                        },
                        next,
                        None,
                        now,
                        out,
                    ),
                    None => {
                        let next = self.rules.skip(&state, slot);
                        self.commit(AppliedAction::Forfeited { by, cause }, next, None, now, out);
                    }
                }
            }
            MissedTurnPolicy::ForfeitGame => {
                let name = self.session.slot(slot).map_or("", |s| s.name.as_str());
                let verdict = self.rules.forfeit_verdict(&state, slot).unwrap_or_else(|| {
                    let others = (0..self.session.slot_count())
                        .filter_map(|i| u32::try_from(i).ok().map(SlotId))
                        .filter(|s| *s != slot)
                        .collect();
                    Verdict::win(others, format!("{name} forfeited"))
                });
                self.commit(
                    AppliedAction::Forfeited { by, cause },
                    state,
                    Some(verdict),
                    now,
                    out,
                );
            }
        }
    }

    fn maybe_resolve_votes(&mut self, now: Instant, out: &mut Outbox) {
        let all_closed = matches!(
            &self.phase,
            Phase::Awaiting(PendingTurn { kind: PendingKind::Vote { ballots }, .. })
                if ballots.values().all(|v| v.closed)
        );
        if all_closed {
            self.resolve_votes(now, out);
        }
    }

    fn resolve_votes(&mut self, now: Instant, out: &mut Outbox) {
        let Phase::Awaiting(PendingTurn {
            kind: PendingKind::Vote { ballots },
            ..
        }) = &mut self.phase
        else {
            return;
        };
        let ballots: Vec<SlotBallot<R::Action>> = std::mem::take(ballots)
            .into_iter()
            .map(|(slot, vote)| SlotBallot {
                slot,
                choice: vote.choice,
            })
            .collect();
        let Some(state) = self.state.as_ref() else {
            return;
        };
        let next = self.rules.resolve(state, &ballots, &mut self.tie);
        let wire = ballots
            .iter()
            .filter_map(|b| {
                self.session.holder(b.slot).map(|voter| Ballot {
                    voter: voter.clone(),
                    choice: b.choice.as_ref().map(to_json),
                })
            })
            .collect();
        self.commit(AppliedAction::Joint { ballots: wire }, next, None, now, out);
    }

    fn on_deadline(&mut self, now: Instant, out: &mut Outbox) {
        let Phase::Awaiting(pending) = &mut self.phase else {
            return;
        };
        match &mut pending.kind {
            PendingKind::Single { slot, .. } => {
                let slot = *slot;
                self.miss_turn(slot, ForfeitCause::Timeout, now, out);
            }
            PendingKind::Vote { ballots } => {
                let silent = ballots.values().filter(|v| !v.closed).count();
                for vote in ballots.values_mut() {
                    vote.closed = true;
                }
                info!(session = %self.config.session_id, turn = %pending.seq, silent, "vote deadline passed");
                self.resolve_votes(now, out);
            }
        }
    }

    /// A slot holder left, was swept by the hub, or could not be reached.
    fn handle_departure(&mut self, id: &ParticipantId, now: Instant, out: &mut Outbox) {
        if self.session.remove_observer(id) {
            debug!(session = %self.config.session_id, observer = %id, "observer gone");
            return;
        }
        let Some(slot) = self.session.slot_of(id) else {
            return;
        };
        match self.session.status() {
            SessionStatus::Forming => {
                self.session.release(id);
                info!(session = %self.config.session_id, participant = %id, "slot released");
            }
            SessionStatus::InProgress => {
                if self.session.is_present(slot) {
                    warn!(session = %self.config.session_id, participant = %id, "player unreachable");
                }
                self.session.mark_absent(id);
                self.on_unreachable(slot, id, now, out);
            }
            SessionStatus::Terminated => {}
        }
    }

    fn on_unreachable(&mut self, slot: SlotId, id: &ParticipantId, now: Instant, out: &mut Outbox) {
        match &mut self.phase {
            Phase::Awaiting(pending) if pending.owed_by(slot) => match &mut pending.kind {
                PendingKind::Single { .. } => {
                    self.miss_turn(slot, ForfeitCause::Unreachable, now, out);
                }
                PendingKind::Vote { ballots } => {
                    if let Some(vote) = ballots.get_mut(&slot) {
                        vote.closed = true;
                    }
                    self.maybe_resolve_votes(now, out);
                }
            },
            Phase::Broadcasting(b) => {
                b.awaiting.remove(id);
                if b.awaiting.is_empty() {
                    self.begin_turn(now, out);
                }
            }
            _ => {}
        }
    }

    // --- commit and broadcast ---

    fn commit(
        &mut self,
        applied: AppliedAction,
        next: R::State,
        forced: Option<Verdict>,
        now: Instant,
        out: &mut Outbox,
    ) {
        let seq = self.next_seq;
        self.next_seq = seq.next();

        let mut outcome = forced
            .or_else(|| self.rules.is_terminal(&next))
            .map(|verdict| self.outcome_of(verdict));
        if outcome.is_none() {
            if let Some(max) = self.config.max_turns.filter(|max| self.next_seq.0 >= *max) {
                outcome = Some(Outcome::Draw {
                    summary: format!("turn limit of {max} reached"),
                });
            }
        }

        let delta = StateDelta {
            session_id: self.config.session_id.clone(),
            turn_seq: seq,
            applied,
            state: to_json(&next),
            terminal: outcome.is_some(),
            outcome,
        };
        self.state = Some(next);
        self.record_and_broadcast(delta, now, out);
    }

    fn outcome_of(&self, verdict: Verdict) -> Outcome {
        if verdict.winners.is_empty() {
            return Outcome::Draw {
                summary: verdict.summary,
            };
        }
        Outcome::Win {
            winners: verdict
                .winners
                .iter()
                .filter_map(|s| self.session.holder(*s).cloned())
                .collect(),
            summary: verdict.summary,
        }
    }

    fn record_and_broadcast(&mut self, delta: StateDelta, now: Instant, out: &mut Outbox) {
        if let Err(e) = self.history.push(delta.clone()) {
            warn!(session = %self.config.session_id, error = %e, "history rejected own delta");
        }
        for id in self.session.audience() {
            out.send(&id, GameMessage::Delta(delta.clone()));
        }
        info!(
            session = %self.config.session_id,
            turn = %delta.turn_seq,
            terminal = delta.terminal,
            "turn committed"
        );

        if delta.terminal {
            self.session.advance(SessionStatus::Terminated);
            self.phase = Phase::Terminated;
            info!(session = %self.config.session_id, outcome = ?delta.outcome, "session terminated");
            return;
        }

        let awaiting: BTreeSet<ParticipantId> = (0..self.session.slot_count())
            .filter_map(|i| u32::try_from(i).ok().map(SlotId))
            .filter(|s| self.session.is_present(*s))
            .filter_map(|s| self.session.holder(s).cloned())
            .collect();
        if awaiting.is_empty() {
            self.begin_turn(now, out);
            return;
        }
        self.phase = Phase::Broadcasting(PendingBroadcast {
            seq: delta.turn_seq,
            awaiting,
            deadline: now + self.config.delta_ack_timeout(),
            retries_left: self.config.delta_retries,
        });
    }

    fn handle_ack(&mut self, from: &ParticipantId, seq: TurnSeq, now: Instant, out: &mut Outbox) {
        let Phase::Broadcasting(b) = &mut self.phase else {
            return;
        };
        if b.seq != seq {
            return;
        }
        b.awaiting.remove(from);
        if b.awaiting.is_empty() {
            self.begin_turn(now, out);
        }
    }

    fn on_ack_deadline(&mut self, now: Instant, out: &mut Outbox) {
        let ack_timeout = self.config.delta_ack_timeout();
        let Phase::Broadcasting(b) = &mut self.phase else {
            return;
        };
        if b.retries_left == 0 {
            warn!(
                session = %self.config.session_id,
                turn = %b.seq,
                missing = ?b.awaiting,
                "delta not acknowledged, continuing"
            );
            self.begin_turn(now, out);
            return;
        }
        b.retries_left -= 1;
        b.deadline = now + ack_timeout;
        debug!(session = %self.config.session_id, turn = %b.seq, missing = b.awaiting.len(), "re-sending delta");
        if let Some(delta) = self.history.latest() {
            for id in &b.awaiting {
                out.send(id, GameMessage::Delta(delta.clone()));
            }
        }
    }

    fn handle_snapshot(&mut self, from: &ParticipantId, out: &mut Outbox) {
        if self.session.add_observer(from) {
            debug!(session = %self.config.session_id, observer = %from, "observer subscribed");
        }
        out.send(
            from,
            GameMessage::Snapshot {
                session_id: self.config.session_id.clone(),
                latest: self.history.latest().cloned(),
            },
        );
    }
}

impl<R: RuleChecker> Participant for Authority<R> {
    fn role(&self) -> Role {
        Role::Authority
    }

    fn on_event(&mut self, event: HubEvent, now: Instant, out: &mut Outbox) {
        match event {
            HubEvent::Welcome { participants } => {
                debug!(session = %self.config.session_id, registered = participants.len(), "authority connected");
            }
            HubEvent::Joined(info) => {
                if self.session.mark_present(&info.id).is_some() {
                    debug!(session = %self.config.session_id, participant = %info.id, "holder reconnected");
                }
            }
            HubEvent::Left { id, reason } => {
                debug!(session = %self.config.session_id, participant = %id, ?reason, "participant left hub");
                self.handle_departure(&id, now, out);
            }
            HubEvent::SendFailed { to } => self.handle_departure(&to, now, out),
            HubEvent::Message { from, message } => {
                if message.session_id() != &self.config.session_id {
                    if let GameMessage::Join { session_id } = message {
                        let reason = JoinError::WrongSession(session_id.clone()).to_string();
                        out.send(&from, GameMessage::JoinRejected { session_id, reason });
                    } else {
                        debug!(participant = %from, "ignoring message for another session");
                    }
                    return;
                }
                match message {
                    GameMessage::Join { .. } => self.handle_join(from, now, out),
                    GameMessage::Action(action) => self.handle_action(from, action, now, out),
                    GameMessage::DeltaAck { turn_seq, .. } => {
                        self.handle_ack(&from, turn_seq, now, out);
                    }
                    GameMessage::SnapshotRequest { .. } => self.handle_snapshot(&from, out),
                    other => debug!(participant = %from, ?other, "authority ignoring message"),
                }
            }
        }
    }

    fn on_tick(&mut self, now: Instant, out: &mut Outbox) {
        match &self.phase {
            Phase::Forming => {
                if self.forming_deadline.is_some_and(|at| now >= at) {
                    let reason = format!(
                        "session did not fill in time ({} of {} slots taken)",
                        self.session.filled(),
                        self.session.slot_count()
                    );
                    self.abort(reason, now, out);
                }
            }
            Phase::Awaiting(p) if now >= p.deadline => self.on_deadline(now, out),
            Phase::Broadcasting(b) if now >= b.deadline => self.on_ack_deadline(now, out),
            _ => {}
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        match &self.phase {
            Phase::Forming => self.forming_deadline,
            Phase::Awaiting(p) => Some(p.deadline),
            Phase::Broadcasting(b) => Some(b.deadline),
            Phase::Terminated => None,
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Terminated)
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!(error = %e, "value not representable as JSON");
        Value::Null
    })
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
