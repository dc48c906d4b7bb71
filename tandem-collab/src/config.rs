//! Room and transport configuration.
//!
//! [`RoomConfig`] is the user-facing surface and loads from camelCase JSON
//! where every key is optional. [`TransportConfig`] is the slice of it the
//! transport needs, in `Duration`s.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_core::ConflictStrategy;

/// Upper bound on any single reconnect delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Options recognized by a room. Intervals are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoomConfig {
    /// Base delay before the first reconnect attempt
    pub reconnect_interval: u64,
    /// Automatic reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Ping period while connected
    pub heartbeat_interval: u64,
    /// Connect timeout
    pub timeout: u64,
    /// Presence entries older than this are pruned
    pub idle_timeout: u64,
    /// Batching hint for document engines
    pub conflict_strategy: ConflictStrategy,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: 1_000,
            max_reconnect_attempts: 10,
            heartbeat_interval: 30_000,
            timeout: 10_000,
            idle_timeout: 60_000,
            conflict_strategy: ConflictStrategy::Merge,
        }
    }
}

/// Errors loading a [`RoomConfig`].
#[derive(Debug)]
pub enum ConfigError {
    Parse(serde_json::Error),
    /// A value parsed but cannot be used
    Invalid { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "Config parse error: {e}"),
            Self::Invalid { field, reason } => write!(f, "Invalid {field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
            Self::Invalid { .. } => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e)
    }
}

impl RoomConfig {
    /// Parse from JSON and validate. Missing keys take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or break the room's timers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("heartbeatInterval", self.heartbeat_interval),
            ("timeout", self.timeout),
            ("idleTimeout", self.idle_timeout),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout)
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            reconnect_interval: self.reconnect_interval(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            heartbeat_interval: self.heartbeat_interval(),
            timeout: self.timeout(),
            max_backoff: MAX_BACKOFF,
        }
    }
}

/// Transport timing.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub timeout: Duration,
    pub max_backoff: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        RoomConfig::default().transport()
    }
}
