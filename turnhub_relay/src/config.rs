// Hub configuration.
//
// Every field has a default, so an empty TOML file (or no file at all) gives
// a working local hub. The `hub` binary loads a file if one is given and then
// applies command-line overrides on top.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default listen address for a local hub.
pub const DEFAULT_BIND: &str = "127.0.0.1:50060";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address to listen on. Port 0 lets the OS pick.
    pub bind: String,
    /// Per-recipient limit on messages held for a disconnected participant.
    pub queue_capacity: usize,
    /// A registration not heard from for this long is removed and announced
    /// as unreachable.
    pub liveness_timeout_ms: u64,
    /// How often the hub checks for expired registrations.
    pub sweep_interval_ms: u64,
    /// How long a new connection has to send `Hello`.
    pub handshake_timeout_ms: u64,
    /// A write to a client that blocks this long detaches the connection;
    /// later messages for it go to its mailbox.
    pub write_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.into(),
            queue_capacity: 256,
            liveness_timeout_ms: 15_000,
            sweep_interval_ms: 500,
            handshake_timeout_ms: 5_000,
            write_timeout_ms: 2_000,
        }
    }
}

impl HubConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("sweep_interval_ms must be positive".into()));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid("write_timeout_ms must be positive".into()));
        }
        if self.liveness_timeout_ms < self.sweep_interval_ms {
            return Err(ConfigError::Invalid(
                "liveness_timeout_ms must not be shorter than sweep_interval_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
