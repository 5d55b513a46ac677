//! Configuration for the relay.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use changefeed_relay::config::RelayConfig;
//!
//! let config = RelayConfig {
//!     relay_id: "orders-relay".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! RelayConfig
//! ├── relay_id: String             # Names this relay in logs, metrics, checkpoints
//! ├── feed: FeedConfig             # Start point, batch size, reconnect policy
//! ├── apply: ApplyConfig           # Per-event transaction timeout
//! ├── slo: SloConfig               # Lag warning threshold
//! └── checkpoint: CheckpointConfig # Optional SQLite checkpoint persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! relay_id: "orders-relay"
//!
//! feed:
//!   batch_size: 2000
//!   max_await: "1s"
//!   start_lookback: "10h"
//!   max_reconnect_attempts: 10
//!
//! apply:
//!   timeout: "2s"
//!
//! slo:
//!   max_replication_lag_sec: 30
//!
//! checkpoint:
//!   sqlite_path: "/var/lib/relay/checkpoints.db"
//! ```

use crate::error::{RelayError, Result};
use crate::event::LogicalTime;
use crate::lag;
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Identity of this relay. Labels metrics and keys the stored checkpoint.
    pub relay_id: String,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub apply: ApplyConfig,

    #[serde(default)]
    pub slo: SloConfig,

    /// Checkpoint persistence. In-memory only unless `sqlite_path` is set.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_id: "changefeed-relay".to_string(),
            feed: FeedConfig::default(),
            apply: ApplyConfig::default(),
            slo: SloConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Create a minimal config for testing.
    ///
    /// Starts at the beginning of the feed, polls quickly and fails fast.
    pub fn for_testing(relay_id: &str) -> Self {
        Self {
            relay_id: relay_id.to_string(),
            feed: FeedConfig {
                batch_size: 100,
                max_await: "20ms".to_string(),
                start_at: Some(0),
                max_reconnect_attempts: 3,
                reconnect_initial_delay: "10ms".to_string(),
                reconnect_max_delay: "100ms".to_string(),
                ..FeedConfig::default()
            },
            apply: ApplyConfig::default(),
            slo: SloConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }

    /// Reject configurations the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.relay_id.trim().is_empty() {
            return Err(RelayError::Config("relay_id must not be empty".to_string()));
        }
        if self.feed.batch_size == 0 {
            return Err(RelayError::Config("feed.batch_size must be > 0".to_string()));
        }
        if self.feed.max_reconnect_attempts == 0 {
            return Err(RelayError::Config(
                "feed.max_reconnect_attempts must be > 0".to_string(),
            ));
        }
        parse_duration("feed.max_await", &self.feed.max_await)?;
        parse_duration("feed.start_lookback", &self.feed.start_lookback)?;
        parse_duration("feed.reconnect_initial_delay", &self.feed.reconnect_initial_delay)?;
        parse_duration("feed.reconnect_max_delay", &self.feed.reconnect_max_delay)?;
        if self.apply.timeout_duration()?.is_zero() {
            return Err(RelayError::Config("apply.timeout must be > 0".to_string()));
        }
        if let Some(path) = &self.checkpoint.sqlite_path {
            if path.trim().is_empty() {
                return Err(RelayError::Config(
                    "checkpoint.sqlite_path must not be empty when set".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| RelayError::Config(format!("{} {:?} is not a duration: {}", field, value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// FeedConfig: change feed consumption
// ═══════════════════════════════════════════════════════════════════════════════

/// Change feed settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Maximum events per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long one poll may wait for new events, as a duration string ("1s").
    #[serde(default = "default_max_await")]
    pub max_await: String,

    /// Start this far before now when `start_at` is unset ("10h").
    #[serde(default = "default_start_lookback")]
    pub start_lookback: String,

    /// Explicit start point, unix seconds. Overrides `start_lookback`.
    #[serde(default)]
    pub start_at: Option<u32>,

    /// Ask the source to attach post-images to update events.
    #[serde(default = "default_true")]
    pub include_post_image: bool,

    /// Consecutive transient feed failures tolerated before the relay gives up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: usize,

    #[serde(default = "default_reconnect_initial_delay")]
    pub reconnect_initial_delay: String,

    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay: String,
}

fn default_batch_size() -> usize {
    2000
}

fn default_max_await() -> String {
    "1s".to_string()
}

fn default_start_lookback() -> String {
    "10h".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_reconnect_attempts() -> usize {
    10
}

fn default_reconnect_initial_delay() -> String {
    "500ms".to_string()
}

fn default_reconnect_max_delay() -> String {
    "30s".to_string()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_await: default_max_await(),
            start_lookback: default_start_lookback(),
            start_at: None,
            include_post_image: true,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_initial_delay: default_reconnect_initial_delay(),
            reconnect_max_delay: default_reconnect_max_delay(),
        }
    }
}

impl FeedConfig {
    /// Parse the max_await string to a Duration.
    pub fn max_await_duration(&self) -> Duration {
        humantime::parse_duration(&self.max_await).unwrap_or(Duration::from_secs(1))
    }

    /// Parse the start_lookback string to a Duration.
    pub fn start_lookback_duration(&self) -> Duration {
        humantime::parse_duration(&self.start_lookback).unwrap_or(Duration::from_secs(10 * 3600))
    }

    /// Logical start time relative to `now`: `start_at`, else `now - start_lookback`.
    ///
    /// The increment is 1, the first ordinal within a second.
    pub fn start_time(&self, now: SystemTime) -> LogicalTime {
        let seconds = match self.start_at {
            Some(seconds) => seconds,
            None => {
                let lookback = i64::try_from(self.start_lookback_duration().as_secs()).unwrap_or(i64::MAX);
                let start = lag::unix_seconds(now).saturating_sub(lookback);
                start.clamp(0, i64::from(u32::MAX)) as u32
            }
        };
        LogicalTime::new(seconds, 1)
    }

    /// Backoff schedule for feed reconnects.
    pub fn retry_config(&self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            max_attempts: self.max_reconnect_attempts,
            initial_delay: humantime::parse_duration(&self.reconnect_initial_delay)
                .unwrap_or(defaults.initial_delay),
            max_delay: humantime::parse_duration(&self.reconnect_max_delay)
                .unwrap_or(defaults.max_delay),
            backoff_factor: defaults.backoff_factor,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ApplyConfig: per-event transactions
// ═══════════════════════════════════════════════════════════════════════════════

/// Transactional apply settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Wall-clock bound on begin + operation + commit ("2s").
    #[serde(default = "default_apply_timeout")]
    pub timeout: String,
}

fn default_apply_timeout() -> String {
    "2s".to_string()
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            timeout: default_apply_timeout(),
        }
    }
}

impl ApplyConfig {
    pub fn timeout_duration(&self) -> Result<Duration> {
        parse_duration("apply.timeout", &self.timeout)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SloConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// SLO thresholds. Violations are reported, never acted on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloConfig {
    /// Maximum acceptable replication lag (seconds) at a batch head.
    #[serde(default = "default_max_replication_lag_sec")]
    pub max_replication_lag_sec: u64,
}

fn default_max_replication_lag_sec() -> u64 {
    30
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            max_replication_lag_sec: default_max_replication_lag_sec(),
        }
    }
}

impl SloConfig {
    /// Whether `lag_secs` violates the lag SLO.
    pub fn is_lag_violation(&self, lag_secs: i64) -> bool {
        lag_secs > 0 && lag_secs as u64 > self.max_replication_lag_sec
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// SQLite database file. `None` keeps the checkpoint in memory only.
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

impl CheckpointConfig {
    /// Persist checkpoints to `path`.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            sqlite_path: Some(path.into()),
        }
    }
}
