// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transactional apply of a single mutation.
//!
//! Each mutation runs in its own transaction on a session that is reused
//! across events:
//!
//! ```text
//! begin ──▶ insert | delete | upsert ──▶ commit
//!   │                 │                     │
//!   └─────────────────┴── error / timeout ──┴──▶ abort
//! ```
//!
//! The whole begin → commit span is bounded by one timeout. Expiry aborts only
//! this transaction; the caller moves on to the next event.
//!
//! # Outcomes
//!
//! | Target result | Outcome |
//! |---------------|---------|
//! | committed | `Success` |
//! | `DuplicateKey` on insert | `BenignConflict` |
//! | timeout | `Failure(Timeout)` |
//! | any other error | `Failure(..)` |
//!
//! Delete of a missing document and upsert of a missing document both commit
//! normally, so replays of those are plain `Success`.

use crate::document::{DocumentKey, Namespace};
use crate::metrics;
use crate::target::{TargetError, TargetResult, TargetSession, TargetStore};
use crate::translate::{MutationKind, TargetMutation};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Why an apply attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Transaction did not commit within the apply timeout.
    Timeout(Duration),
    /// Transient store condition.
    Transient(String),
    /// Session or connection lost.
    Connection(String),
    /// Store refused the write.
    Rejected(String),
}

impl FailureReason {
    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::Timeout(_) => "timeout",
            FailureReason::Transient(_) => "transient",
            FailureReason::Connection(_) => "connection",
            FailureReason::Rejected(_) => "rejected",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout(d) => write!(f, "timed out after {}ms", d.as_millis()),
            FailureReason::Transient(msg) => write!(f, "transient: {}", msg),
            FailureReason::Connection(msg) => write!(f, "connection: {}", msg),
            FailureReason::Rejected(msg) => write!(f, "rejected: {}", msg),
        }
    }
}

impl From<TargetError> for FailureReason {
    fn from(e: TargetError) -> Self {
        match e {
            TargetError::Transient(msg) => FailureReason::Transient(msg),
            TargetError::Connection(msg) => FailureReason::Connection(msg),
            TargetError::Rejected(msg) => FailureReason::Rejected(msg),
            // Only reachable when a non-insert primitive reports a duplicate
            dup @ TargetError::DuplicateKey { .. } => FailureReason::Rejected(dup.to_string()),
        }
    }
}

/// Context for a failed apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyFailure {
    pub kind: MutationKind,
    pub key: Option<DocumentKey>,
    pub namespace: Namespace,
    pub reason: FailureReason,
}

/// Result of one apply attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Success,
    /// Duplicate-key insert: the effect is already present on the target.
    BenignConflict { key: DocumentKey },
    Failure(ApplyFailure),
}

impl ApplyOutcome {
    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            ApplyOutcome::Success => "success",
            ApplyOutcome::BenignConflict { .. } => "conflict",
            ApplyOutcome::Failure(_) => "failure",
        }
    }
}

/// Applies mutations to the target, one transaction per mutation.
pub struct TransactionalApplier<T: TargetStore> {
    target: Arc<T>,
    /// Reused across events; replaced after a connection error.
    session: Option<T::Session>,
    timeout: Duration,
}

impl<T: TargetStore> TransactionalApplier<T> {
    pub fn new(target: Arc<T>, timeout: Duration) -> Self {
        Self {
            target,
            session: None,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a session is currently held.
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Apply one mutation to `namespace`.
    ///
    /// Never returns an error: every failure becomes an [`ApplyOutcome`].
    pub async fn apply(&mut self, mutation: TargetMutation, namespace: &Namespace) -> ApplyOutcome {
        let kind = mutation.kind();
        if mutation.is_skip() {
            return ApplyOutcome::Success;
        }
        let key = mutation.key();
        let start = Instant::now();

        let outcome = match self.run(mutation, namespace).await {
            Ok(()) => ApplyOutcome::Success,
            Err(ApplyError::Target(e)) if e.is_duplicate_key() && kind == MutationKind::Insert => {
                self.abort(namespace).await;
                match key {
                    Some(key) => ApplyOutcome::BenignConflict { key },
                    None => ApplyOutcome::Failure(ApplyFailure {
                        kind,
                        key: None,
                        namespace: namespace.clone(),
                        reason: FailureReason::from(e),
                    }),
                }
            }
            Err(ApplyError::Target(e)) => {
                self.abort(namespace).await;
                if e.is_session_lost() {
                    debug!(namespace = %namespace, "Discarding target session after connection error");
                    self.session = None;
                }
                ApplyOutcome::Failure(ApplyFailure {
                    kind,
                    key,
                    namespace: namespace.clone(),
                    reason: FailureReason::from(e),
                })
            }
            Err(ApplyError::Timeout) => {
                self.abort(namespace).await;
                ApplyOutcome::Failure(ApplyFailure {
                    kind,
                    key,
                    namespace: namespace.clone(),
                    reason: FailureReason::Timeout(self.timeout),
                })
            }
        };

        let elapsed = start.elapsed();
        metrics::record_apply(namespace, kind.as_str(), outcome.label(), elapsed);
        trace!(
            namespace = %namespace,
            op = %kind,
            outcome = outcome.label(),
            duration_ms = elapsed.as_millis(),
            "Mutation applied"
        );
        outcome
    }

    /// Session acquisition plus the bounded transaction.
    async fn run(&mut self, mutation: TargetMutation, namespace: &Namespace) -> Result<(), ApplyError> {
        let timeout = self.timeout;
        let session = self.session().await?;
        match tokio::time::timeout(timeout, run_transaction(session, mutation, namespace)).await {
            Ok(result) => result.map_err(ApplyError::Target),
            Err(_elapsed) => Err(ApplyError::Timeout),
        }
    }

    async fn session(&mut self) -> Result<&mut T::Session, ApplyError> {
        if self.session.is_none() {
            match tokio::time::timeout(self.timeout, self.target.start_session()).await {
                Ok(Ok(session)) => {
                    debug!("Target session started");
                    self.session = Some(session);
                }
                Ok(Err(e)) => return Err(ApplyError::Target(e)),
                Err(_elapsed) => return Err(ApplyError::Timeout),
            }
        }
        self.session
            .as_mut()
            .ok_or_else(|| ApplyError::Target(TargetError::Connection("no target session".to_string())))
    }

    /// Best-effort abort of the open transaction, bounded by the apply timeout.
    async fn abort(&mut self, namespace: &Namespace) {
        let timeout = self.timeout;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match tokio::time::timeout(timeout, session.abort_transaction()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(namespace = %namespace, error = %e, "Transaction abort failed");
                if e.is_session_lost() {
                    self.session = None;
                }
            }
            Err(_elapsed) => {
                warn!(namespace = %namespace, "Transaction abort timed out, discarding session");
                self.session = None;
            }
        }
    }
}

enum ApplyError {
    Target(TargetError),
    Timeout,
}

async fn run_transaction<S: TargetSession>(
    session: &mut S,
    mutation: TargetMutation,
    namespace: &Namespace,
) -> TargetResult<()> {
    session.begin_transaction().await?;
    match mutation {
        TargetMutation::Insert { document } => session.insert_one(namespace, document).await?,
        TargetMutation::DeleteByKey { key } => {
            let removed = session.delete_by_key(namespace, &key).await?;
            if !removed {
                trace!(namespace = %namespace, key = %key, "Delete target already absent");
            }
        }
        TargetMutation::UpsertByKey { key, document } => {
            session.upsert_by_key(namespace, &key, document).await?
        }
        TargetMutation::Skip { .. } => {}
    }
    session.commit_transaction().await
}
