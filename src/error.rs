// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the relay.
//!
//! Only feed-level and lifecycle failures are errors. Per-event failures on the
//! target side are never surfaced here: they become an
//! [`ApplyOutcome`](crate::applier::ApplyOutcome) and are contained at the event
//! boundary by the classifier.
//!
//! # Error Categories
//!
//! | Error Type | Fatal | Description |
//! |------------|-------|-------------|
//! | `FeedInvalidated` | Yes | Feed history no longer covers our resume position |
//! | `FeedUnavailable` | Yes | Feed unreadable after exhausting reconnect attempts |
//! | `Feed` | No | Transient feed read error (reader reconnects) |
//! | `CheckpointStore` | No | Local SQLite errors (checkpoint stays in memory) |
//! | `Config` | Yes | Configuration invalid |
//! | `InvalidState` | Yes | Engine state machine violation |
//! | `Internal` | Yes | Unexpected internal error |
//!
//! A fatal feed error requires operator intervention: re-seed the start point
//! or clear the stored checkpoint. The relay never silently restarts from an
//! arbitrary position.

use crate::event::ResumeToken;
use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can stop (or fail to start) the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The source feed can no longer be read from the required position.
    ///
    /// Typically the retention window was exceeded before the checkpoint
    /// became durable, or the resume token is not recognised by the source.
    #[error("Change feed invalidated (checkpoint: {}): {reason}", display_checkpoint(.checkpoint))]
    FeedInvalidated {
        checkpoint: Option<ResumeToken>,
        reason: String,
    },

    /// The feed kept failing with transient errors until the reconnect
    /// budget was exhausted.
    #[error("Change feed unavailable after {attempts} attempts: {message}")]
    FeedUnavailable { attempts: usize, message: String },

    /// A single transient feed failure (the reader retries these).
    #[error("Change feed error ({operation}): {message}")]
    Feed { operation: String, message: String },

    /// SQLite error during checkpoint persistence.
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation (e.g. `start()` twice).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn display_checkpoint(checkpoint: &Option<ResumeToken>) -> String {
    match checkpoint {
        Some(token) => token.to_string(),
        None => "none".to_string(),
    }
}

impl RelayError {
    /// Create a transient feed error.
    pub fn feed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Feed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether this error terminates the relay.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::FeedInvalidated { .. } => true,
            Self::FeedUnavailable { .. } => true,
            Self::Feed { .. } => false,
            Self::CheckpointStore(_) => false,
            Self::Config(_) => true,
            Self::InvalidState { .. } => true,
            Self::Internal(_) => true,
        }
    }

    /// Whether the failed operation may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Feed { .. })
    }
}
