// turnhub_authority — turn arbitration on top of the turnhub message hub.
//
// One process per role: the authority owns a session's canonical state and
// drives its turn loop; players answer turn requests; viewers follow the
// delta stream. All three talk to each other only through the hub, by
// exchanging `GameMessage`s (see `turnhub_protocol::game`).
//
// Module overview:
// - `rules.rs`:       `RuleChecker`, the seam to a game's rules. The
//                     authority asks it whose turn it is, what is legal, how
//                     to apply an action, and whether the game is over.
// - `tally.rs`:       Plurality vote counting with a configurable tie-break,
//                     for rule-checkers that resolve simultaneous phases.
// - `session.rs`:     Slot roster and the forward-only session status.
// - `authority.rs`:   `Authority<R>`, the per-session turn state machine.
// - `player.rs`:      `PlayerAgent<D>`, which forwards turn requests to a
//                     `Decider` and submits its answer.
// - `viewer.rs`:      `History` (gap-free delta log) and the `Viewer`
//                     observer.
// - `participant.rs`: The `Participant` contract all roles share, and
//                     `run_participant`, the loop that connects one to the
//                     hub, heartbeats, reconnects, and feeds it events.
// - `config.rs`:      `SessionConfig`: slots, timeouts, policies, presets.
//
// The state machines are sans-IO: they take events and the current time and
// push outgoing messages into an `Outbox`. Only `run_participant` touches
// the network, so every turn rule is unit-testable without sockets.

pub mod authority;
pub mod config;
pub mod participant;
pub mod player;
pub mod rules;
pub mod session;
pub mod tally;
pub mod viewer;

pub use authority::{Authority, AuthorityPhase};
pub use config::{ConfigError, MissedTurnPolicy, SessionConfig, SlotAssignment};
pub use participant::{HubEvent, Outbox, Outgoing, Participant, RunError, RunOptions, run_participant};
pub use player::{Decider, FirstLegal, PlayerAgent, PlayerExit, RandomLegal, TurnView};
pub use rules::{IllegalReason, RuleChecker, SlotBallot, SlotInfo, Turn, Verdict};
pub use session::{JoinError, Joined, Session, SessionStatus};
pub use tally::{TieBreak, TieBreaker};
pub use viewer::{History, HistoryError, Viewer};
