// Session bootstrap configuration.
//
// Everything the authority needs to run one session: which session and hub
// to use, the slot layout, per-slot timeouts, and the policies applied when
// a player is silent, keeps sending illegal actions, or a vote ties.
//
// Sources, lowest precedence first: `SessionConfig::default()` (or a preset),
// a TOML file, then the `TURNHUB_SESSION_ID` / `TURNHUB_AUTHORITY_ID`
// environment variables, which is how launch scripts hand every process of
// one game the same session scope.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use turnhub_protocol::types::{ParticipantId, SessionId};

use crate::tally::TieBreak;

pub const SESSION_ID_ENV: &str = "TURNHUB_SESSION_ID";
pub const AUTHORITY_ID_ENV: &str = "TURNHUB_AUTHORITY_ID";

pub const DEFAULT_AUTHORITY_ID: &str = "board_starter";
pub const DEFAULT_HUB_ADDR: &str = "127.0.0.1:50060";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// What happens to a turn its owner did not complete: the deadline passed,
/// the illegal-action budget ran out, or the owner became unreachable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedTurnPolicy {
    /// Pass the turn; the rule-checker's `skip` decides the new state.
    #[default]
    Skip,
    /// Play a random legal action on the owner's behalf (falls back to
    /// `Skip` when nothing is legal).
    RandomLegal,
    /// The owner loses the game.
    ForfeitGame,
}

/// How joining players are matched to free slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotAssignment {
    /// A free slot drawn from the session's seeded generator.
    #[default]
    Random,
    /// The lowest free slot.
    InOrder,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub session_id: SessionId,
    pub authority_id: ParticipantId,
    pub hub_addr: String,
    /// Slot names in turn-order position. Names may repeat.
    pub slots: Vec<String>,
    pub slot_assignment: SlotAssignment,
    pub seed: u64,
    /// Time a slot gets to answer a turn request.
    pub turn_timeout_ms: u64,
    /// Per-slot-name overrides of `turn_timeout_ms`.
    pub slot_timeouts_ms: BTreeMap<String, u64>,
    /// Illegal actions tolerated per turn before it counts as missed.
    pub illegal_retry_budget: u32,
    pub missed_turn: MissedTurnPolicy,
    pub tie_break: TieBreak,
    /// How long to wait for every slot to fill. `None` waits forever.
    pub forming_timeout_ms: Option<u64>,
    /// Committed turns after which the game ends in a draw.
    pub max_turns: Option<u64>,
    /// Time players get to acknowledge a delta before it is re-sent.
    pub delta_ack_timeout_ms: u64,
    /// Re-sends of an unacknowledged delta before the turn loop moves on.
    pub delta_retries: u32,
    pub heartbeat_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: SessionId::new("turnhub"),
            authority_id: ParticipantId::new(DEFAULT_AUTHORITY_ID),
            hub_addr: DEFAULT_HUB_ADDR.into(),
            slots: vec!["white".into(), "black".into()],
            slot_assignment: SlotAssignment::Random,
            seed: 0,
            turn_timeout_ms: 30_000,
            slot_timeouts_ms: BTreeMap::new(),
            illegal_retry_budget: 3,
            missed_turn: MissedTurnPolicy::Skip,
            tie_break: TieBreak::SlotOrder,
            forming_timeout_ms: Some(300_000),
            max_turns: None,
            delta_ack_timeout_ms: 2_000,
            delta_retries: 2,
            heartbeat_interval_ms: 1_000,
        }
    }
}

impl SessionConfig {
    /// Two players, white and black, drawn at random; the game is declared
    /// a draw after 100 committed turns.
    pub fn chess() -> Self {
        Self {
            session_id: SessionId::new("chess"),
            max_turns: Some(100),
            ..Self::default()
        }
    }

    /// Six players: two wolves, two villagers, a seer, and a witch.
    pub fn werewolf() -> Self {
        Self {
            session_id: SessionId::new("werewolf"),
            slots: ["wolf", "wolf", "village", "village", "seer", "witch"]
                .into_iter()
                .map(String::from)
                .collect(),
            turn_timeout_ms: 60_000,
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Apply `TURNHUB_SESSION_ID` and `TURNHUB_AUTHORITY_ID` from the process
    /// environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply the environment overrides from an arbitrary lookup.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup(SESSION_ID_ENV).filter(|v| !v.is_empty()) {
            self.session_id = SessionId::new(id);
        }
        if let Some(id) = lookup(AUTHORITY_ID_ENV).filter(|v| !v.is_empty()) {
            self.authority_id = ParticipantId::new(id);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_id.as_str().is_empty() {
            return Err(ConfigError::Invalid("session_id must not be empty".into()));
        }
        if self.authority_id.as_str().is_empty() {
            return Err(ConfigError::Invalid("authority_id must not be empty".into()));
        }
        if self.slots.is_empty() {
            return Err(ConfigError::Invalid("at least one slot is required".into()));
        }
        if self.turn_timeout_ms == 0 {
            return Err(ConfigError::Invalid("turn_timeout_ms must be positive".into()));
        }
        if self.illegal_retry_budget == 0 {
            return Err(ConfigError::Invalid(
                "illegal_retry_budget must be at least 1".into(),
            ));
        }
        if let Some(name) = self
            .slot_timeouts_ms
            .keys()
            .find(|name| !self.slots.contains(*name))
        {
            return Err(ConfigError::Invalid(format!(
                "slot_timeouts_ms names unknown slot {name:?}"
            )));
        }
        Ok(())
    }

    /// Turn timeout for a slot name.
    pub fn timeout_for(&self, slot_name: &str) -> Duration {
        Duration::from_millis(
            self.slot_timeouts_ms
                .get(slot_name)
                .copied()
                .unwrap_or(self.turn_timeout_ms),
        )
    }

    pub fn forming_timeout(&self) -> Option<Duration> {
        self.forming_timeout_ms.map(Duration::from_millis)
    }

    pub fn delta_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.delta_ack_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
