//! Engine state and run accounting types.
//!
//! # State Transitions
//!
//! ```text
//!              start()
//! Idle ───────────────────→ FeedOpen ←──────────────┐
//!                             │  │                  │
//!             (empty batch)   │  │ (batch)          │ (batch drained,
//!             ┌───────────────┘  ↓                  │  checkpoint advanced)
//!             └──→ FeedOpen    Draining ────────────┘
//!                             │
//!        (shutdown / end of feed)      (fatal feed error)
//!                             ↓                ↓
//!                          Stopped           Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Idle**: Created by `ReplicationEngine::new()`. Nothing opened.
//! - **FeedOpen**: Waiting on the change feed for the next batch.
//! - **Draining**: Applying a batch, one event at a time.
//! - **Stopped**: Clean exit. Checkpoint persisted.
//! - **Failed**: The feed cannot be resumed. Operator action required.

use crate::event::ResumeToken;
use std::fmt;

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    FeedOpen,
    Draining,
    Stopped,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "Idle"),
            EngineState::FeedOpen => write!(f, "FeedOpen"),
            EngineState::Draining => write!(f, "Draining"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Per-batch outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    /// Committed mutations.
    pub applied: usize,
    /// Duplicate-key inserts ignored.
    pub conflicts: usize,
    /// Events translated to `Skip`.
    pub skipped: usize,
    /// Apply failures (logged, not retried).
    pub failed: usize,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Why the relay loop exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Shutdown was signalled.
    Shutdown,
    /// The source closed the feed.
    EndOfFeed,
    /// The relay was stopped after the drain grace period expired.
    Aborted,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Shutdown => write!(f, "shutdown"),
            ExitReason::EndOfFeed => write!(f, "end of feed"),
            ExitReason::Aborted => write!(f, "aborted"),
        }
    }
}

/// Totals for one relay run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySummary {
    pub batches: u64,
    pub events: u64,
    pub applied: u64,
    pub conflicts: u64,
    pub skipped: u64,
    pub failed: u64,
    pub empty_polls: u64,
    pub reconnects: u64,
    /// Last committed checkpoint.
    pub checkpoint: Option<ResumeToken>,
    pub exit: ExitReason,
}

impl RelaySummary {
    pub fn new(exit: ExitReason) -> Self {
        Self {
            batches: 0,
            events: 0,
            applied: 0,
            conflicts: 0,
            skipped: 0,
            failed: 0,
            empty_polls: 0,
            reconnects: 0,
            checkpoint: None,
            exit,
        }
    }

    /// Fold a drained batch into the totals.
    pub fn record_batch(&mut self, batch: &BatchSummary) {
        self.batches += 1;
        self.events += batch.total as u64;
        self.applied += batch.applied as u64;
        self.conflicts += batch.conflicts as u64;
        self.skipped += batch.skipped as u64;
        self.failed += batch.failed as u64;
    }
}
