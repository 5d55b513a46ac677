// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed diagnostics emitted by the relay loop.
//!
//! The engine never logs operator-facing conditions directly; it builds a
//! [`Diagnostic`] and hands it to the configured [`DiagnosticSink`]. The
//! default [`TracingSink`] forwards to `tracing` at the diagnostic's severity.

use crate::applier::ApplyFailure;
use crate::document::{DocumentKey, Namespace};
use crate::event::{OperationKind, ResumeToken};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How loud a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// One operator-facing condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// A non-empty batch is about to be drained.
    BatchStarted {
        /// Delay of the batch's first event.
        lag_secs: i64,
        /// Events processed before this batch.
        processed: u64,
        events: usize,
        checkpoint: ResumeToken,
    },
    /// A poll returned nothing within the await window.
    NoChanges { checkpoint: Option<ResumeToken> },
    /// Insert hit an existing key; the effect is already present.
    DuplicateKeySkipped {
        namespace: Namespace,
        key: DocumentKey,
        delay_secs: i64,
    },
    /// A mutation could not be applied. The event is lost for this run.
    ApplyFailed {
        /// Source operation, before translation.
        operation: OperationKind,
        failure: ApplyFailure,
        delay_secs: i64,
    },
    /// The source emitted an operation kind the relay does not replicate.
    UnknownOperation {
        namespace: Namespace,
        operation: String,
        delay_secs: i64,
    },
    /// Insert/update/replace without a post-image.
    MissingPostImage {
        namespace: Namespace,
        operation: OperationKind,
        key: DocumentKey,
        delay_secs: i64,
    },
    /// Batch-head delay is above the configured SLO.
    LagThresholdExceeded { lag_secs: i64, threshold_secs: u64 },
    /// Transient feed error; the reader will reopen after `delay`.
    FeedReconnecting {
        attempt: usize,
        delay: Duration,
        reason: String,
    },
    /// The feed can no longer be resumed. Terminal.
    FeedInvalidated {
        checkpoint: Option<ResumeToken>,
        reason: String,
    },
    /// Reconnect budget exhausted. Terminal.
    FeedUnavailable {
        checkpoint: Option<ResumeToken>,
        attempts: usize,
        message: String,
    },
}

impl Diagnostic {
    pub fn severity(&self) -> Severity {
        match self {
            Diagnostic::NoChanges { .. } => Severity::Debug,
            Diagnostic::BatchStarted { .. } | Diagnostic::DuplicateKeySkipped { .. } => Severity::Info,
            Diagnostic::UnknownOperation { .. }
            | Diagnostic::MissingPostImage { .. }
            | Diagnostic::LagThresholdExceeded { .. }
            | Diagnostic::FeedReconnecting { .. } => Severity::Warn,
            Diagnostic::ApplyFailed { .. }
            | Diagnostic::FeedInvalidated { .. }
            | Diagnostic::FeedUnavailable { .. } => Severity::Error,
        }
    }

    /// Stable short name.
    pub fn kind(&self) -> &'static str {
        match self {
            Diagnostic::BatchStarted { .. } => "batch_started",
            Diagnostic::NoChanges { .. } => "no_changes",
            Diagnostic::DuplicateKeySkipped { .. } => "duplicate_key_skipped",
            Diagnostic::ApplyFailed { .. } => "apply_failed",
            Diagnostic::UnknownOperation { .. } => "unknown_operation",
            Diagnostic::MissingPostImage { .. } => "missing_post_image",
            Diagnostic::LagThresholdExceeded { .. } => "lag_threshold_exceeded",
            Diagnostic::FeedReconnecting { .. } => "feed_reconnecting",
            Diagnostic::FeedInvalidated { .. } => "feed_invalidated",
            Diagnostic::FeedUnavailable { .. } => "feed_unavailable",
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::BatchStarted {
                lag_secs,
                processed,
                events,
                checkpoint,
            } => write!(
                f,
                "Processing {} events (lag {}s, {} processed so far, checkpoint {})",
                events, lag_secs, processed, checkpoint
            ),
            Diagnostic::NoChanges { .. } => f.write_str("No changes"),
            Diagnostic::DuplicateKeySkipped {
                namespace,
                key,
                delay_secs,
            } => write!(
                f,
                "Duplicate key {} in {}, skipping (delay {}s)",
                key, namespace, delay_secs
            ),
            Diagnostic::ApplyFailed {
                operation,
                failure,
                delay_secs,
            } => {
                write!(
                    f,
                    "Failed to apply {} ({}) to {}",
                    operation, failure.kind, failure.namespace
                )?;
                if let Some(key) = &failure.key {
                    write!(f, " for key {}", key)?;
                }
                write!(f, ": {} (delay {}s)", failure.reason, delay_secs)
            }
            Diagnostic::UnknownOperation {
                namespace,
                operation,
                delay_secs,
            } => write!(
                f,
                "Unknown operation kind {} on {}, skipping (delay {}s)",
                operation, namespace, delay_secs
            ),
            Diagnostic::MissingPostImage {
                namespace,
                operation,
                key,
                delay_secs,
            } => write!(
                f,
                "{} on {} for key {} has no post-image, skipping (delay {}s)",
                operation, namespace, key, delay_secs
            ),
            Diagnostic::LagThresholdExceeded {
                lag_secs,
                threshold_secs,
            } => write!(
                f,
                "Replication lag {}s exceeds threshold {}s",
                lag_secs, threshold_secs
            ),
            Diagnostic::FeedReconnecting {
                attempt,
                delay,
                reason,
            } => write!(
                f,
                "Change feed error ({}), reconnect attempt {} in {}ms",
                reason,
                attempt,
                delay.as_millis()
            ),
            Diagnostic::FeedInvalidated { checkpoint, reason } => match checkpoint {
                Some(token) => write!(f, "Change feed invalidated at {}: {}", token, reason),
                None => write!(f, "Change feed invalidated: {}", reason),
            },
            Diagnostic::FeedUnavailable {
                checkpoint,
                attempts,
                message,
            } => {
                write!(f, "Change feed unavailable after {} attempts: {}", attempts, message)?;
                if let Some(token) = checkpoint {
                    write!(f, " (checkpoint {})", token)?;
                }
                Ok(())
            }
        }
    }
}

/// Destination for diagnostics.
pub trait DiagnosticSink: Send + Sync + 'static {
    fn emit(&self, diagnostic: Diagnostic);
}

/// Forwards diagnostics to `tracing` at their severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, diagnostic: Diagnostic) {
        let kind = diagnostic.kind();
        match diagnostic.severity() {
            Severity::Debug => debug!(kind, "{}", diagnostic),
            Severity::Info => info!(kind, "{}", diagnostic),
            Severity::Warn => warn!(kind, "{}", diagnostic),
            Severity::Error => error!(kind, "{}", diagnostic),
        }
    }
}

/// Keeps every diagnostic in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    collected: Arc<Mutex<Vec<Diagnostic>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far, in order.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.collected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of diagnostics of `kind`.
    pub fn count(&self, kind: &str) -> usize {
        self.collected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|d| d.kind() == kind)
            .count()
    }

    pub fn clear(&self) {
        self.collected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diagnostic: Diagnostic) {
        self.collected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::FailureReason;
    use crate::document::Value;
    use crate::translate::MutationKind;

    fn key() -> DocumentKey {
        DocumentKey::from_value(&Value::Int(1))
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(Diagnostic::NoChanges { checkpoint: None }.severity(), Severity::Debug);
        assert_eq!(
            Diagnostic::DuplicateKeySkipped {
                namespace: Namespace::new("db", "c"),
                key: key(),
                delay_secs: 0
            }
            .severity(),
            Severity::Info
        );
        assert_eq!(
            Diagnostic::LagThresholdExceeded {
                lag_secs: 40,
                threshold_secs: 30
            }
            .severity(),
            Severity::Warn
        );
        assert!(Severity::Error > Severity::Warn);
    }

    #[test]
    fn test_apply_failed_message_has_context() {
        let diagnostic = Diagnostic::ApplyFailed {
            operation: OperationKind::Replace,
            failure: ApplyFailure {
                kind: MutationKind::Upsert,
                key: Some(key()),
                namespace: Namespace::new("shop", "orders"),
                reason: FailureReason::Timeout(Duration::from_secs(2)),
            },
            delay_secs: 3,
        };
        let msg = diagnostic.to_string();
        assert!(msg.contains("replace (upsert)"));
        assert!(msg.contains("shop.orders"));
        assert!(msg.contains("key 1"));
        assert!(msg.contains("timed out"));
        assert!(msg.contains("delay 3s"));
        assert_eq!(diagnostic.severity(), Severity::Error);
    }

    #[test]
    fn test_collecting_sink_shares_buffer() {
        let sink = CollectingSink::new();
        let clone = sink.clone();
        clone.emit(Diagnostic::NoChanges { checkpoint: None });
        clone.emit(Diagnostic::NoChanges { checkpoint: None });
        assert_eq!(sink.count("no_changes"), 2);
        assert_eq!(sink.diagnostics().len(), 2);
        sink.clear();
        assert!(clone.diagnostics().is_empty());
    }

    #[test]
    fn test_tracing_sink_does_not_panic() {
        let sink = TracingSink;
        sink.emit(Diagnostic::FeedInvalidated {
            checkpoint: Some(ResumeToken::new("0a")),
            reason: "truncated".into(),
        });
        sink.emit(Diagnostic::NoChanges { checkpoint: None });
    }

    #[test]
    fn test_feed_invalidated_display() {
        let diagnostic = Diagnostic::FeedInvalidated {
            checkpoint: Some(ResumeToken::new("0a")),
            reason: "truncated".into(),
        };
        assert_eq!(diagnostic.to_string(), "Change feed invalidated at 0a: truncated");
    }

    #[test]
    fn test_feed_unavailable_is_error() {
        let diagnostic = Diagnostic::FeedUnavailable {
            checkpoint: None,
            attempts: 3,
            message: "no primary".into(),
        };
        assert_eq!(diagnostic.severity(), Severity::Error);
        assert_eq!(diagnostic.kind(), "feed_unavailable");
        assert_eq!(
            diagnostic.to_string(),
            "Change feed unavailable after 3 attempts: no primary"
        );
    }
}
