// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-event error policy.
//!
//! | Outcome | Action | Diagnostic |
//! |---------|--------|------------|
//! | `Success` | `Continue` | none |
//! | `BenignConflict` | `Ignore` | `DuplicateKeySkipped` (info) |
//! | `Failure` | `LogAndContinue` | `ApplyFailed` (error) |
//!
//! Every action lets the stream proceed. Nothing is retried.

use crate::applier::ApplyOutcome;
use crate::diagnostics::Diagnostic;
use crate::event::ChangeEvent;
use crate::translate::SkipReason;

/// What the loop does after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Ignore,
    LogAndContinue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub action: Action,
    pub diagnostic: Option<Diagnostic>,
}

/// Classify an apply outcome for `event`. Pure.
pub fn classify(outcome: &ApplyOutcome, event: &ChangeEvent, delay_secs: i64) -> Verdict {
    match outcome {
        ApplyOutcome::Success => Verdict {
            action: Action::Continue,
            diagnostic: None,
        },
        ApplyOutcome::BenignConflict { key } => Verdict {
            action: Action::Ignore,
            diagnostic: Some(Diagnostic::DuplicateKeySkipped {
                namespace: event.namespace.clone(),
                key: key.clone(),
                delay_secs,
            }),
        },
        ApplyOutcome::Failure(failure) => Verdict {
            action: Action::LogAndContinue,
            diagnostic: Some(Diagnostic::ApplyFailed {
                operation: event.operation.clone(),
                failure: failure.clone(),
                delay_secs,
            }),
        },
    }
}

/// Diagnostic for an event the translator skipped.
pub fn skip_diagnostic(reason: &SkipReason, event: &ChangeEvent, delay_secs: i64) -> Diagnostic {
    match reason {
        SkipReason::UnknownOperation(operation) => Diagnostic::UnknownOperation {
            namespace: event.namespace.clone(),
            operation: operation.clone(),
            delay_secs,
        },
        SkipReason::MissingPostImage(operation) => Diagnostic::MissingPostImage {
            namespace: event.namespace.clone(),
            operation: operation.clone(),
            key: event.key(),
            delay_secs,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::{ApplyFailure, FailureReason};
    use crate::diagnostics::Severity;
    use crate::document::{DocumentKey, Namespace, Value};
    use crate::event::{LogicalTime, OperationKind, ResumeToken};
    use crate::translate::MutationKind;
    use std::time::Duration;

    fn event() -> ChangeEvent {
        ChangeEvent {
            resume_token: ResumeToken::new("01"),
            operation: OperationKind::Insert,
            cluster_time: LogicalTime::new(100, 1),
            namespace: Namespace::new("shop", "orders"),
            document_key: Value::Int(1),
            full_document: None,
        }
    }

    #[test]
    fn test_success_continues_silently() {
        let verdict = classify(&ApplyOutcome::Success, &event(), 0);
        assert_eq!(verdict.action, Action::Continue);
        assert!(verdict.diagnostic.is_none());
    }

    #[test]
    fn test_conflict_is_ignored_with_low_severity() {
        let key = DocumentKey::from_value(&Value::Int(1));
        let verdict = classify(&ApplyOutcome::BenignConflict { key: key.clone() }, &event(), 4);
        assert_eq!(verdict.action, Action::Ignore);
        let diagnostic = verdict.diagnostic.unwrap();
        assert_eq!(diagnostic.severity(), Severity::Info);
        assert_eq!(
            diagnostic,
            Diagnostic::DuplicateKeySkipped {
                namespace: Namespace::new("shop", "orders"),
                key,
                delay_secs: 4,
            }
        );
    }

    #[test]
    fn test_failure_logs_and_continues() {
        let failure = ApplyFailure {
            kind: MutationKind::Delete,
            key: Some(DocumentKey::from_value(&Value::Int(1))),
            namespace: Namespace::new("shop", "orders"),
            reason: FailureReason::Timeout(Duration::from_secs(2)),
        };
        let verdict = classify(&ApplyOutcome::Failure(failure.clone()), &event(), 9);
        assert_eq!(verdict.action, Action::LogAndContinue);
        assert_eq!(
            verdict.diagnostic,
            Some(Diagnostic::ApplyFailed {
                operation: OperationKind::Insert,
                failure,
                delay_secs: 9
            })
        );
    }

    #[test]
    fn test_failure_reports_source_operation() {
        let mut replace = event();
        replace.operation = OperationKind::Replace;
        replace.document_key = Value::Int(7);
        let failure = ApplyFailure {
            kind: MutationKind::Upsert,
            key: Some(DocumentKey::from_value(&Value::Int(7))),
            namespace: Namespace::new("shop", "orders"),
            reason: FailureReason::Transient("conflict".into()),
        };

        let diagnostic = classify(&ApplyOutcome::Failure(failure), &replace, 1)
            .diagnostic
            .unwrap();
        assert_eq!(
            diagnostic.to_string(),
            "Failed to apply replace (upsert) to shop.orders for key 7: transient: conflict (delay 1s)"
        );
    }

    #[test]
    fn test_skip_diagnostics() {
        let unknown = skip_diagnostic(&SkipReason::UnknownOperation("drop".into()), &event(), 1);
        assert_eq!(unknown.kind(), "unknown_operation");

        let missing = skip_diagnostic(&SkipReason::MissingPostImage(OperationKind::Update), &event(), 1);
        match missing {
            Diagnostic::MissingPostImage { key, operation, .. } => {
                assert_eq!(key.as_str(), "1");
                assert_eq!(operation, OperationKind::Update);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
