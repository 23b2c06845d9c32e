// Test-only games and process harness for turnhub integration tests.
//
// Two tiny rule-checkers exercise both turn shapes the authority supports:
// `Countdown` (alternating single-slot turns) and `Elimination` (one
// simultaneous vote per round). The `spawn_*` helpers run a real hub, a real
// `Authority`, real `PlayerAgent`s, and a `Viewer`, each on its own thread
// through `run_participant`, the same loop the binaries use. Only the
// thread plumbing here is test-specific.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use turnhub_authority::{
    Authority, Decider, IllegalReason, PlayerAgent, RuleChecker, RunOptions, SessionConfig,
    SlotAssignment, SlotBallot, SlotInfo, TieBreaker, Turn, Verdict, Viewer, run_participant,
};
use turnhub_protocol::game::StateDelta;
use turnhub_protocol::types::{ParticipantId, SessionId, SlotId};
use turnhub_relay::client::Backoff;
use turnhub_relay::config::HubConfig;
use turnhub_relay::server::{HubHandle, start_hub};

pub const AUTHORITY: &str = "board_starter";

// ---------------------------------------------------------------------------
// Games
// ---------------------------------------------------------------------------

/// Players take turns removing 1-3 tokens; whoever takes the last one wins.
/// A skipped turn passes to the next slot.
pub struct Countdown {
    pub tokens: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct CountdownState {
    pub left: u32,
    pub to_move: u32,
    pub players: u32,
    pub last_taker: Option<u32>,
}

impl RuleChecker for Countdown {
    type State = CountdownState;
    type Action = u32;

    fn initial_state(&self, slots: &[SlotInfo]) -> CountdownState {
        CountdownState {
            left: self.tokens,
            to_move: 0,
            players: u32::try_from(slots.len()).unwrap_or(u32::MAX),
            last_taker: None,
        }
    }

    fn next_turn(&self, state: &CountdownState) -> Turn {
        Turn::Single(SlotId(state.to_move))
    }

    fn legal_actions(&self, state: &CountdownState, _slot: SlotId) -> Vec<u32> {
        (1..=state.left.min(3)).collect()
    }

    fn apply(
        &self,
        state: &CountdownState,
        slot: SlotId,
        take: &u32,
    ) -> Result<CountdownState, IllegalReason> {
        if slot.0 != state.to_move {
            return Err(IllegalReason::new("not your turn"));
        }
        if *take == 0 || *take > state.left.min(3) {
            return Err(IllegalReason::new(format!("cannot take {take} of {}", state.left)));
        }
        Ok(CountdownState {
            left: state.left - take,
            to_move: (state.to_move + 1) % state.players,
            last_taker: Some(slot.0),
            ..*state
        })
    }

    fn skip(&self, state: &CountdownState, _slot: SlotId) -> CountdownState {
        CountdownState {
            to_move: (state.to_move + 1) % state.players,
            ..*state
        }
    }

    fn is_terminal(&self, state: &CountdownState) -> Option<Verdict> {
        if state.left > 0 {
            return None;
        }
        Some(Verdict::win(
            state.last_taker.map(SlotId).into_iter().collect(),
            "took the last token",
        ))
    }
}

/// Every living slot votes to eliminate another; the plurality choice is
/// out. The last two standing win together.
pub struct Elimination;

#[derive(Clone, Debug, Serialize)]
pub struct EliminationState {
    pub alive: Vec<u32>,
    pub eliminated: Vec<u32>,
}

impl RuleChecker for Elimination {
    type State = EliminationState;
    type Action = u32;

    fn initial_state(&self, slots: &[SlotInfo]) -> EliminationState {
        EliminationState {
            alive: slots.iter().map(|s| s.id.0).collect(),
            eliminated: Vec::new(),
        }
    }

    fn next_turn(&self, state: &EliminationState) -> Turn {
        Turn::Simultaneous(state.alive.iter().copied().map(SlotId).collect())
    }

    fn legal_actions(&self, state: &EliminationState, slot: SlotId) -> Vec<u32> {
        state.alive.iter().copied().filter(|s| *s != slot.0).collect()
    }

    fn apply(
        &self,
        state: &EliminationState,
        slot: SlotId,
        target: &u32,
    ) -> Result<EliminationState, IllegalReason> {
        if *target == slot.0 || !state.alive.contains(target) {
            return Err(IllegalReason::new(format!("cannot vote for slot {target}")));
        }
        Ok(state.clone())
    }

    fn resolve(
        &self,
        state: &EliminationState,
        ballots: &[SlotBallot<u32>],
        tie: &mut TieBreaker,
    ) -> EliminationState {
        let mut next = state.clone();
        if let Some(out) = tie.plurality(ballots).copied() {
            next.alive.retain(|s| *s != out);
            next.eliminated.push(out);
        }
        next
    }

    fn skip(&self, state: &EliminationState, _slot: SlotId) -> EliminationState {
        state.clone()
    }

    fn is_terminal(&self, state: &EliminationState) -> Option<Verdict> {
        (state.alive.len() <= 2).then(|| {
            Verdict::win(
                state.alive.iter().copied().map(SlotId).collect(),
                "last ones standing",
            )
        })
    }
}

/// Never answers a turn request.
pub struct Silent;

impl Decider for Silent {
    fn decide(&mut self, _view: &turnhub_authority::TurnView<'_>) -> Option<serde_json::Value> {
        None
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn pid(name: &str) -> ParticipantId {
    ParticipantId::new(name)
}

/// Start a hub on a random localhost port.
pub fn start_test_hub() -> (HubHandle, SocketAddr) {
    start_hub(HubConfig {
        bind: "127.0.0.1:0".into(),
        ..HubConfig::default()
    })
    .expect("hub failed to start")
}

/// Session with slots `p0..pN`, filled in join order, and short timeouts.
pub fn session_config(session: &str, slots: usize) -> SessionConfig {
    SessionConfig {
        session_id: SessionId::new(session),
        authority_id: pid(AUTHORITY),
        slots: (0..slots).map(|i| format!("p{i}")).collect(),
        slot_assignment: SlotAssignment::InOrder,
        turn_timeout_ms: 2_000,
        delta_ack_timeout_ms: 500,
        forming_timeout_ms: Some(10_000),
        heartbeat_interval_ms: 200,
        ..SessionConfig::default()
    }
}

/// What a player or viewer needs from the session config: hub, scope,
/// authority, heartbeat.
fn joiner_config(addr: SocketAddr, session: &str) -> SessionConfig {
    SessionConfig {
        hub_addr: addr.to_string(),
        ..session_config(session, 0)
    }
}

fn options(config: &SessionConfig, id: &ParticipantId) -> RunOptions {
    let mut options = RunOptions::for_session(config, id.clone());
    options.backoff = Backoff::new(Duration::from_millis(20), Duration::from_millis(200), 2);
    options.max_connect_attempts = Some(50);
    options
}

pub fn spawn_authority<R>(addr: SocketAddr, config: SessionConfig, rules: R) -> JoinHandle<Authority<R>>
where
    R: RuleChecker + Send + 'static,
    R::State: Send,
    R::Action: Send,
{
    let config = SessionConfig {
        hub_addr: addr.to_string(),
        ..config
    };
    thread::spawn(move || {
        let options = options(&config, &config.authority_id);
        let mut authority =
            Authority::new(config, rules, Instant::now()).expect("invalid session config");
        run_participant(&mut authority, &options).expect("authority run failed");
        authority
    })
}

pub fn spawn_player<D>(
    addr: SocketAddr,
    session: &str,
    name: &str,
    decider: D,
) -> JoinHandle<PlayerAgent<D>>
where
    D: Decider + Send + 'static,
{
    let config = joiner_config(addr, session);
    let id = pid(name);
    thread::spawn(move || {
        let options = options(&config, &id);
        let mut player = PlayerAgent::new(id, config.session_id, config.authority_id, decider)
            .with_join_backoff(Backoff::new(Duration::from_millis(20), Duration::from_millis(200), 2));
        run_participant(&mut player, &options).expect("player run failed");
        player
    })
}

/// Viewer that also collects every delta it hands to its sink.
pub fn spawn_viewer(
    addr: SocketAddr,
    session: &str,
) -> (JoinHandle<Viewer>, Arc<Mutex<Vec<StateDelta>>>) {
    let config = joiner_config(addr, session);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = thread::spawn(move || {
        let options = options(&config, &pid("watcher"));
        let mut viewer = Viewer::new(config.session_id, config.authority_id).with_sink(move |delta| {
            sink.lock().expect("sink poisoned").push(delta.clone());
        });
        run_participant(&mut viewer, &options).expect("viewer run failed");
        viewer
    });
    (handle, seen)
}

/// The participant holding `slot` among finished players.
pub fn holder_of<D: Decider>(players: &[PlayerAgent<D>], slot: u32) -> ParticipantId {
    players
        .iter()
        .find(|p| p.slot() == Some(SlotId(slot)))
        .map(|p| p.id().clone())
        .expect("no player holds that slot")
}
