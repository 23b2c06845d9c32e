// Delta history and the passive viewer.
//
// `History` is the ordered log of committed `StateDelta`s. It only ever grows
// by the next expected `turn_seq`; re-deliveries of deltas already held are
// recognised and ignored, and anything further ahead is refused as a gap.
// The authority keeps one as the session's record; viewers and players keep
// one as their local copy.
//
// `Viewer` is the observer role. On connecting it asks the authority for a
// snapshot, seeds its history from the latest delta, then follows the live
// stream. Deltas that arrive ahead of a gap are parked until the gap fills,
// so the sink always sees a gap-free, monotonically advancing sequence.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use turnhub_protocol::game::{GameMessage, StateDelta};
use turnhub_protocol::types::{ParticipantId, Role, SessionId, TurnSeq};

use crate::participant::{HubEvent, Outbox, Participant};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("expected delta {expected}, got {got}")]
    Gap { expected: TurnSeq, got: TurnSeq },
    #[error("delta belongs to session {0}")]
    WrongSession(SessionId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Appended {
    New,
    Duplicate,
}

#[derive(Clone, Debug)]
pub struct History {
    session_id: SessionId,
    /// `turn_seq` of `deltas[0]`.
    base: TurnSeq,
    deltas: Vec<StateDelta>,
}

impl History {
    /// Empty history expecting delta 0 first.
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            base: TurnSeq(0),
            deltas: Vec::new(),
        }
    }

    /// History that starts at a snapshot rather than at delta 0.
    pub fn resume_from(delta: StateDelta) -> Self {
        Self {
            session_id: delta.session_id.clone(),
            base: delta.turn_seq,
            deltas: vec![delta],
        }
    }

    pub fn push(&mut self, delta: StateDelta) -> Result<Appended, HistoryError> {
        if delta.session_id != self.session_id {
            return Err(HistoryError::WrongSession(delta.session_id));
        }
        let expected = self.next_seq();
        if delta.turn_seq < expected {
            return Ok(Appended::Duplicate);
        }
        if delta.turn_seq > expected {
            return Err(HistoryError::Gap {
                expected,
                got: delta.turn_seq,
            });
        }
        self.deltas.push(delta);
        Ok(Appended::New)
    }

    /// `turn_seq` the next delta must carry.
    pub fn next_seq(&self) -> TurnSeq {
        TurnSeq(self.base.0 + self.deltas.len() as u64)
    }

    pub fn latest(&self) -> Option<&StateDelta> {
        self.deltas.last()
    }

    pub fn deltas(&self) -> &[StateDelta] {
        &self.deltas
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn is_terminal(&self) -> bool {
        self.latest().is_some_and(|d| d.terminal)
    }
}

/// Callback for every delta the viewer accepts, in order.
pub type DeltaSink = Box<dyn FnMut(&StateDelta) + Send>;

pub struct Viewer {
    session_id: SessionId,
    authority: ParticipantId,
    history: Option<History>,
    /// Deltas received ahead of a gap, by `turn_seq`.
    parked: BTreeMap<TurnSeq, StateDelta>,
    sink: Option<DeltaSink>,
    snapshot_retry_at: Option<Instant>,
    retry_interval: Duration,
    stop_on_terminal: bool,
}

impl Viewer {
    pub fn new(session_id: SessionId, authority: ParticipantId) -> Self {
        Self {
            session_id,
            authority,
            history: None,
            parked: BTreeMap::new(),
            sink: None,
            snapshot_retry_at: None,
            retry_interval: Duration::from_millis(500),
            stop_on_terminal: true,
        }
    }

    pub fn with_sink(mut self, sink: impl FnMut(&StateDelta) + Send + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Keep running after the terminal delta (the default is to finish).
    pub fn keep_running(mut self) -> Self {
        self.stop_on_terminal = false;
        self
    }

    pub fn history(&self) -> Option<&History> {
        self.history.as_ref()
    }

    fn request_snapshot(&mut self, out: &mut Outbox) {
        out.send(
            &self.authority,
            GameMessage::SnapshotRequest {
                session_id: self.session_id.clone(),
            },
        );
    }

    /// Restart the local history at `delta`.
    fn reseed(&mut self, delta: StateDelta) {
        if let Some(sink) = self.sink.as_mut() {
            sink(&delta);
        }
        self.history = Some(History::resume_from(delta));
        self.drain_parked();
    }

    fn accept(&mut self, delta: StateDelta) {
        let history = self
            .history
            .get_or_insert_with(|| History::new(delta.session_id.clone()));
        match history.push(delta.clone()) {
            Ok(Appended::New) => {
                if let Some(sink) = self.sink.as_mut() {
                    sink(&delta);
                }
            }
            Ok(Appended::Duplicate) => {}
            Err(HistoryError::Gap { expected, got }) => {
                debug!(%expected, %got, "parking delta ahead of gap");
                self.parked.insert(got, delta);
                return;
            }
            Err(e) => {
                warn!(error = %e, "ignoring delta");
                return;
            }
        }
        self.drain_parked();
    }

    fn drain_parked(&mut self) {
        loop {
            let Some(history) = self.history.as_ref() else {
                return;
            };
            let next = history.next_seq();
            self.parked.retain(|seq, _| *seq >= next);
            let Some(delta) = self.parked.remove(&next) else {
                return;
            };
            self.accept(delta);
        }
    }
}

impl Participant for Viewer {
    fn role(&self) -> Role {
        Role::Observer
    }

    fn on_event(&mut self, event: HubEvent, now: Instant, out: &mut Outbox) {
        match event {
            HubEvent::Welcome { .. } => self.request_snapshot(out),
            HubEvent::SendFailed { to } if to == self.authority => {
                // Authority not registered yet; ask again shortly.
                self.snapshot_retry_at = Some(now + self.retry_interval);
            }
            HubEvent::Message { from, message } if from == self.authority => match message {
                GameMessage::Snapshot { latest, .. } => {
                    self.snapshot_retry_at = None;
                    let behind = self
                        .history
                        .as_ref()
                        .map(|h| latest.as_ref().is_some_and(|d| d.turn_seq > h.next_seq()));
                    match (latest, behind) {
                        (Some(delta), None) => {
                            info!(turn = %delta.turn_seq, "following session from snapshot");
                            self.reseed(delta);
                        }
                        (Some(delta), Some(true)) => {
                            // Deltas between our history and the snapshot were
                            // lost while we were away; nothing will resend them.
                            warn!(turn = %delta.turn_seq, "missed deltas, resuming from snapshot");
                            self.reseed(delta);
                        }
                        (Some(delta), Some(false)) => self.accept(delta),
                        (None, _) => {}
                    }
                }
                GameMessage::Delta(delta) => self.accept(delta),
                other => debug!(?other, "viewer ignoring message"),
            },
            _ => {}
        }
    }

    fn on_tick(&mut self, now: Instant, out: &mut Outbox) {
        if self.snapshot_retry_at.is_some_and(|at| now >= at) {
            self.snapshot_retry_at = None;
            self.request_snapshot(out);
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.snapshot_retry_at
    }

    fn is_finished(&self) -> bool {
        self.stop_on_terminal && self.history.as_ref().is_some_and(History::is_terminal)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;
    use serde_json::json;
    use turnhub_protocol::game::AppliedAction;

    use super::*;

    fn session() -> SessionId {
        SessionId::new("chess-1")
    }

    fn delta(n: u64) -> StateDelta {
        StateDelta {
            session_id: session(),
            turn_seq: TurnSeq(n),
            applied: AppliedAction::Move {
                by: ParticipantId::new("alice"),
                payload: json!(n),
            },
            state: json!({ "turn": n }),
            terminal: false,
            outcome: None,
        }
    }

    #[test]
    fn history_appends_only_the_next_delta() {
        let mut history = History::new(session());
        assert_eq!(history.push(delta(0)), Ok(Appended::New));
        assert_eq!(history.push(delta(0)), Ok(Appended::Duplicate));
        assert_eq!(
            history.push(delta(2)),
            Err(HistoryError::Gap {
                expected: TurnSeq(1),
                got: TurnSeq(2)
            })
        );
        assert_eq!(history.push(delta(1)), Ok(Appended::New));
        assert_eq!(history.next_seq(), TurnSeq(2));
    }

    #[test]
    fn history_rejects_foreign_sessions() {
        let mut history = History::new(SessionId::new("other"));
        assert!(matches!(
            history.push(delta(0)),
            Err(HistoryError::WrongSession(_))
        ));
    }

    #[test]
    fn resumed_history_counts_from_snapshot() {
        let mut history = History::resume_from(delta(5));
        assert_eq!(history.next_seq(), TurnSeq(6));
        assert_eq!(history.push(delta(4)), Ok(Appended::Duplicate));
        assert_eq!(history.push(delta(6)), Ok(Appended::New));
        assert_eq!(history.len(), 2);
    }

    fn viewer_with_log() -> (Viewer, Arc<Mutex<Vec<u64>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink_log = Arc::clone(&log);
        let viewer = Viewer::new(session(), ParticipantId::new("board_starter"))
            .with_sink(move |d| sink_log.lock().unwrap().push(d.turn_seq.0));
        (viewer, log)
    }

    fn from_board(message: GameMessage) -> HubEvent {
        HubEvent::Message {
            from: ParticipantId::new("board_starter"),
            message,
        }
    }

    #[test]
    fn viewer_requests_snapshot_on_welcome() {
        let (mut viewer, _) = viewer_with_log();
        let mut out = Outbox::new();
        viewer.on_event(HubEvent::Welcome { participants: vec![] }, Instant::now(), &mut out);
        let sent = out.pop().unwrap();
        assert_eq!(sent.to, ParticipantId::new("board_starter"));
        assert!(matches!(sent.message, GameMessage::SnapshotRequest { .. }));
    }

    #[test]
    fn viewer_retries_snapshot_when_authority_is_missing() {
        let (mut viewer, _) = viewer_with_log();
        let mut out = Outbox::new();
        let t0 = Instant::now();
        viewer.on_event(
            HubEvent::SendFailed {
                to: ParticipantId::new("board_starter"),
            },
            t0,
            &mut out,
        );
        let wake = viewer.next_wakeup().unwrap();
        viewer.on_tick(t0, &mut out);
        assert!(out.is_empty());
        viewer.on_tick(wake, &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn viewer_reorders_out_of_sequence_deltas() {
        let (mut viewer, log) = viewer_with_log();
        let mut out = Outbox::new();
        let now = Instant::now();
        viewer.on_event(
            from_board(GameMessage::Snapshot {
                session_id: session(),
                latest: Some(delta(3)),
            }),
            now,
            &mut out,
        );
        viewer.on_event(from_board(GameMessage::Delta(delta(5))), now, &mut out);
        viewer.on_event(from_board(GameMessage::Delta(delta(3))), now, &mut out);
        viewer.on_event(from_board(GameMessage::Delta(delta(4))), now, &mut out);
        viewer.on_event(from_board(GameMessage::Delta(delta(6))), now, &mut out);

        assert_eq!(*log.lock().unwrap(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn viewer_resumes_from_snapshot_after_missing_deltas() {
        let (mut viewer, log) = viewer_with_log();
        let mut out = Outbox::new();
        let t0 = Instant::now();
        viewer.on_event(
            from_board(GameMessage::Snapshot {
                session_id: session(),
                latest: None,
            }),
            t0,
            &mut out,
        );
        viewer.on_event(from_board(GameMessage::Delta(delta(0))), t0, &mut out);

        // Swept by the hub and back: deltas 1 and 2 are gone for good.
        viewer.on_event(HubEvent::Welcome { participants: vec![] }, t0, &mut out);
        let mut last = delta(3);
        last.terminal = true;
        viewer.on_event(
            from_board(GameMessage::Snapshot {
                session_id: session(),
                latest: Some(last.clone()),
            }),
            t0,
            &mut out,
        );
        viewer.on_event(from_board(GameMessage::Delta(last)), t0, &mut out);

        assert_eq!(*log.lock().unwrap(), vec![0, 3]);
        assert!(viewer.is_finished());
        assert_eq!(viewer.history().map(History::next_seq), Some(TurnSeq(4)));
    }

    #[test]
    fn viewer_finishes_on_terminal_delta() {
        let (mut viewer, _) = viewer_with_log();
        let mut out = Outbox::new();
        let mut last = delta(0);
        last.terminal = true;
        viewer.on_event(from_board(GameMessage::Delta(last)), Instant::now(), &mut out);
        assert!(viewer.is_finished());
    }

    #[test]
    fn viewer_ignores_strangers() {
        let (mut viewer, log) = viewer_with_log();
        let mut out = Outbox::new();
        viewer.on_event(
            HubEvent::Message {
                from: ParticipantId::new("mallory"),
                message: GameMessage::Delta(delta(0)),
            },
            Instant::now(),
            &mut out,
        );
        assert!(log.lock().unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn any_arrival_order_yields_contiguous_log(order in Just((0u64..8).collect::<Vec<_>>()).prop_shuffle()) {
            let (mut viewer, log) = viewer_with_log();
            let mut out = Outbox::new();
            let now = Instant::now();
            for n in order {
                viewer.on_event(from_board(GameMessage::Delta(delta(n))), now, &mut out);
            }
            prop_assert_eq!(log.lock().unwrap().clone(), (0..8).collect::<Vec<u64>>());
        }
    }
}
