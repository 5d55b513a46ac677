// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relay loop: read a batch, apply it event by event, commit the checkpoint.
//!
//! One task per engine:
//! 1. Waits on the feed reader (up to `max_await`)
//! 2. Reports batch-head lag and checks the lag SLO
//! 3. Translates and applies each event in feed order
//! 4. Classifies each outcome and emits diagnostics
//! 5. Advances and persists the checkpoint after the whole batch
//!
//! # Graceful Shutdown
//!
//! Shutdown is observed between batches and while waiting on the feed:
//! 1. A pending feed wait or reconnect backoff is cancelled (via `tokio::select!`)
//! 2. A batch already being drained runs to completion
//! 3. The checkpoint of the last drained batch is persisted
//! 4. The feed handle is released before the task exits
//!
//! # Failure Containment
//!
//! Per-event failures never leave this loop: the applier returns an outcome,
//! the classifier turns it into a diagnostic, and the next event is applied.
//! Only fatal feed errors end the loop early.

use crate::applier::TransactionalApplier;
use crate::checkpoint::CheckpointStore;
use crate::classifier::{classify, skip_diagnostic, Action};
use crate::config::SloConfig;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::error::{RelayError, Result};
use crate::event::{ChangeEvent, ResumeToken};
use crate::feed::{ChangeFeed, FeedRead, FeedReader};
use crate::lag;
use crate::metrics;
use crate::target::TargetStore;
use crate::translate::{translate, TargetMutation};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, debug_span, error, info, warn, Instrument};

use super::types::{BatchSummary, EngineState, ExitReason, RelaySummary};

/// Everything the loop needs besides the reader and the shutdown signal.
pub(crate) struct RelayContext<T: TargetStore> {
    pub relay_id: String,
    pub applier: TransactionalApplier<T>,
    pub sink: Arc<dyn DiagnosticSink>,
    pub slo: SloConfig,
    pub checkpoint_store: Arc<RwLock<Option<CheckpointStore>>>,
    pub state_tx: Arc<watch::Sender<EngineState>>,
    pub checkpoint_tx: Arc<watch::Sender<Option<ResumeToken>>>,
}

/// Publish a state change to watchers and the state gauge.
pub(crate) fn set_state(state_tx: &watch::Sender<EngineState>, state: EngineState) {
    let _ = state_tx.send(state);
    metrics::set_engine_state(&state.to_string());
}

/// Run the relay until shutdown, end of feed, or a fatal feed error.
///
/// Returns the run totals on a clean exit. A fatal error leaves the engine in
/// [`EngineState::Failed`] and is returned as-is.
pub(crate) async fn run_relay<F: ChangeFeed, T: TargetStore>(
    mut reader: FeedReader<F>,
    mut ctx: RelayContext<T>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<RelaySummary> {
    let span = tracing::info_span!("relay", relay_id = %ctx.relay_id);

    async move {
        info!(resume_point = %reader.resume_point(), "Starting relay loop");

        let mut summary = RelaySummary::new(ExitReason::Shutdown);

        let exit = loop {
            if *shutdown_rx.borrow() {
                info!("Shutdown signal received between batches");
                break ExitReason::Shutdown;
            }
            set_state(&ctx.state_tx, EngineState::FeedOpen);

            let read = tokio::select! {
                biased;

                // Priority: check shutdown first
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received during feed wait");
                        break ExitReason::Shutdown;
                    }
                    continue;
                }

                read = reader.next_batch() => read,
            };

            match read {
                Ok(FeedRead::Batch { events, checkpoint }) => {
                    set_state(&ctx.state_tx, EngineState::Draining);
                    report_batch_start(&ctx, &events, &checkpoint, summary.events);

                    let start = Instant::now();
                    let batch = drain_batch(&events, &mut ctx.applier, ctx.sink.as_ref()).await;
                    log_batch_result(&ctx.relay_id, &batch, start.elapsed());
                    summary.record_batch(&batch);

                    reader.advance(checkpoint);
                    if let Some(token) = reader.checkpoint() {
                        let _ = ctx.checkpoint_tx.send(Some(token.clone()));
                        persist_checkpoint(&ctx.checkpoint_store, &ctx.relay_id, token).await;
                    }
                }
                Ok(FeedRead::Empty) => {
                    summary.empty_polls += 1;
                    metrics::record_empty_poll(&ctx.relay_id);
                    ctx.sink.emit(Diagnostic::NoChanges {
                        checkpoint: reader.checkpoint().cloned(),
                    });
                }
                Ok(FeedRead::EndOfFeed) => {
                    info!("Change feed closed by source");
                    break ExitReason::EndOfFeed;
                }
                Ok(FeedRead::Reconnecting { attempt, delay, reason }) => {
                    summary.reconnects += 1;
                    ctx.sink.emit(Diagnostic::FeedReconnecting { attempt, delay, reason });

                    tokio::select! {
                        biased;

                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                info!("Shutdown signal received during reconnect backoff");
                                break ExitReason::Shutdown;
                            }
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    reader.close();
                    report_fatal(&ctx, &e, reader.checkpoint());
                    set_state(&ctx.state_tx, EngineState::Failed);
                    return Err(e);
                }
            }
        };

        reader.close();
        summary.checkpoint = reader.checkpoint().cloned();
        summary.exit = exit;

        set_state(&ctx.state_tx, EngineState::Stopped);
        info!(
            exit = %summary.exit,
            batches = summary.batches,
            events = summary.events,
            checkpoint = ?summary.checkpoint,
            "Relay loop stopped"
        );
        Ok(summary)
    }
    .instrument(span)
    .await
}

/// Emit `BatchStarted`, record lag and check the lag SLO.
fn report_batch_start<T: TargetStore>(
    ctx: &RelayContext<T>,
    events: &[ChangeEvent],
    checkpoint: &ResumeToken,
    processed: u64,
) {
    let Some(head) = events.first() else {
        return;
    };
    let lag_secs = lag::event_delay_seconds(head);

    ctx.sink.emit(Diagnostic::BatchStarted {
        lag_secs,
        processed,
        events: events.len(),
        checkpoint: checkpoint.clone(),
    });

    metrics::record_replication_lag(&ctx.relay_id, lag_secs);
    metrics::set_replication_lag_slo(&ctx.relay_id, lag_secs, ctx.slo.max_replication_lag_sec);
    if ctx.slo.is_lag_violation(lag_secs) {
        metrics::record_slo_violation(&ctx.relay_id, lag_secs);
        ctx.sink.emit(Diagnostic::LagThresholdExceeded {
            lag_secs,
            threshold_secs: ctx.slo.max_replication_lag_sec,
        });
    }
}

/// Apply every event of a batch in order. Never fails.
async fn drain_batch<T: TargetStore>(
    events: &[ChangeEvent],
    applier: &mut TransactionalApplier<T>,
    sink: &dyn DiagnosticSink,
) -> BatchSummary {
    let mut batch = BatchSummary {
        total: events.len(),
        ..BatchSummary::default()
    };

    for event in events {
        let span = debug_span!(
            "apply_event",
            namespace = %event.namespace,
            op = %event.operation,
            token = %event.resume_token
        );

        async {
            let delay_secs = lag::event_delay_seconds(event);

            let mutation = translate(event);
            if let TargetMutation::Skip { reason } = &mutation {
                let diagnostic = skip_diagnostic(reason, event, delay_secs);
                metrics::record_event_skipped(diagnostic.kind());
                sink.emit(diagnostic);
                batch.skipped += 1;
                return;
            }

            let outcome = applier.apply(mutation, &event.namespace).await;
            let verdict = classify(&outcome, event, delay_secs);
            match verdict.action {
                Action::Continue => batch.applied += 1,
                Action::Ignore => batch.conflicts += 1,
                Action::LogAndContinue => batch.failed += 1,
            }
            if let Some(diagnostic) = verdict.diagnostic {
                sink.emit(diagnostic);
            }
        }
        .instrument(span)
        .await;
    }

    batch
}

fn report_fatal<T: TargetStore>(
    ctx: &RelayContext<T>,
    error: &RelayError,
    checkpoint: Option<&ResumeToken>,
) {
    let error_type = match error {
        RelayError::FeedInvalidated { checkpoint, reason } => {
            ctx.sink.emit(Diagnostic::FeedInvalidated {
                checkpoint: checkpoint.clone(),
                reason: reason.clone(),
            });
            "feed_invalidated"
        }
        RelayError::FeedUnavailable { attempts, message } => {
            ctx.sink.emit(Diagnostic::FeedUnavailable {
                checkpoint: checkpoint.cloned(),
                attempts: *attempts,
                message: message.clone(),
            });
            "feed_unavailable"
        }
        _ => "internal",
    };
    metrics::record_error(&ctx.relay_id, error_type);
    error!(error = %error, "Relay stopped on fatal feed error");
}

/// Log batch result at appropriate level and emit metrics.
fn log_batch_result(relay_id: &str, result: &BatchSummary, duration: Duration) {
    if result.total == 0 {
        return;
    }

    metrics::record_batch(
        relay_id,
        result.total,
        result.applied,
        result.conflicts,
        result.skipped,
        result.failed,
        duration,
    );

    if result.is_success() {
        debug!(
            relay_id = %relay_id,
            total = result.total,
            applied = result.applied,
            conflicts = result.conflicts,
            skipped = result.skipped,
            duration_ms = duration.as_millis(),
            "Batch drained"
        );
    } else {
        warn!(
            relay_id = %relay_id,
            total = result.total,
            failed = result.failed,
            "Batch drained with apply failures"
        );
    }
}

/// Persist the checkpoint if a durable store is configured.
///
/// A failed save keeps the relay running on its in-memory checkpoint.
async fn persist_checkpoint(
    checkpoint_store: &Arc<RwLock<Option<CheckpointStore>>>,
    relay_id: &str,
    token: &ResumeToken,
) {
    let store_guard = checkpoint_store.read().await;
    if let Some(ref store) = *store_guard {
        match store.save(relay_id, token).await {
            Ok(()) => metrics::record_checkpoint_persist(relay_id, true),
            Err(e) => {
                warn!(error = %e, token = %token, "Failed to persist checkpoint, continuing in memory");
                metrics::record_checkpoint_persist(relay_id, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingSink;
    use crate::document::{Document, DocumentKey, Namespace, Value};
    use crate::event::{LogicalTime, OperationKind};
    use crate::feed::{FeedError, FeedOptions, FeedStart};
    use crate::memory::{MemoryChangeFeed, MemoryEvent, MemoryTarget};
    use crate::resilience::RetryConfig;
    use crate::target::TargetError;

    fn ns() -> Namespace {
        Namespace::new("shop", "orders")
    }

    fn event(operation: OperationKind, id: i64, doc: Option<Document>) -> ChangeEvent {
        ChangeEvent {
            resume_token: ResumeToken::new(format!("{:016x}", id)),
            operation,
            cluster_time: LogicalTime::new(100, 1),
            namespace: ns(),
            document_key: Value::Int(id),
            full_document: doc,
        }
    }

    fn memory_event(operation: OperationKind, id: i64, doc: Option<Document>) -> MemoryEvent {
        MemoryEvent {
            operation,
            cluster_time: LogicalTime::new(100, 1),
            namespace: ns(),
            document_key: Value::Int(id),
            full_document: doc,
        }
    }

    fn doc(id: i64) -> Document {
        Document::new().with("_id", id).with("qty", 1i64)
    }

    struct Harness {
        feed: MemoryChangeFeed,
        target: MemoryTarget,
        sink: CollectingSink,
        state_rx: watch::Receiver<EngineState>,
        checkpoint_rx: watch::Receiver<Option<ResumeToken>>,
        shutdown_tx: watch::Sender<bool>,
    }

    fn spawn_relay(
        slo_secs: u64,
    ) -> (Harness, tokio::task::JoinHandle<Result<RelaySummary>>) {
        let feed = MemoryChangeFeed::new();
        let target = MemoryTarget::new();
        let sink = CollectingSink::new();
        let (state_tx, state_rx) = watch::channel(EngineState::Idle);
        let (checkpoint_tx, checkpoint_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reader = FeedReader::new(
            Arc::new(feed.clone()),
            FeedOptions {
                start: FeedStart::At(LogicalTime::new(0, 0)),
                batch_size: 10,
                max_await: Duration::from_millis(10),
                include_post_image: true,
            },
            RetryConfig::testing(),
        );
        let ctx = RelayContext {
            relay_id: "relay-test".to_string(),
            applier: TransactionalApplier::new(Arc::new(target.clone()), Duration::from_secs(1)),
            sink: Arc::new(sink.clone()),
            slo: SloConfig {
                max_replication_lag_sec: slo_secs,
            },
            checkpoint_store: Arc::new(RwLock::new(None)),
            state_tx: Arc::new(state_tx),
            checkpoint_tx: Arc::new(checkpoint_tx),
        };

        let handle = tokio::spawn(run_relay(reader, ctx, shutdown_rx));
        (
            Harness {
                feed,
                target,
                sink,
                state_rx,
                checkpoint_rx,
                shutdown_tx,
            },
            handle,
        )
    }

    #[tokio::test]
    async fn test_drain_batch_counts_every_outcome() {
        let target = MemoryTarget::new();
        target.seed(&ns(), doc(1));
        let mut applier = TransactionalApplier::new(Arc::new(target.clone()), Duration::from_secs(1));
        let sink = CollectingSink::new();

        let events = vec![
            event(OperationKind::Insert, 1, Some(doc(1))),
            event(OperationKind::Insert, 2, Some(doc(2))),
            event(OperationKind::Update, 3, None),
            event(OperationKind::Other("drop".into()), 4, None),
            event(OperationKind::Delete, 1, None),
        ];
        let batch = drain_batch(&events, &mut applier, &sink).await;

        assert_eq!(
            batch,
            BatchSummary {
                total: 5,
                applied: 2,
                conflicts: 1,
                skipped: 2,
                failed: 0,
            }
        );
        assert_eq!(sink.count("duplicate_key_skipped"), 1);
        assert_eq!(sink.count("missing_post_image"), 1);
        assert_eq!(sink.count("unknown_operation"), 1);
        assert!(target.get(&ns(), &DocumentKey::from_value(&Value::Int(1))).is_none());
        assert!(target.get(&ns(), &DocumentKey::from_value(&Value::Int(2))).is_some());
    }

    #[tokio::test]
    async fn test_drain_batch_failure_does_not_block_next_event() {
        let target = MemoryTarget::new();
        target.fail_next_write(TargetError::Transient("write conflict".into()));
        let mut applier = TransactionalApplier::new(Arc::new(target.clone()), Duration::from_secs(1));
        let sink = CollectingSink::new();

        let events = vec![
            event(OperationKind::Insert, 1, Some(doc(1))),
            event(OperationKind::Insert, 2, Some(doc(2))),
        ];
        let batch = drain_batch(&events, &mut applier, &sink).await;

        assert_eq!(batch.failed, 1);
        assert_eq!(batch.applied, 1);
        assert_eq!(sink.count("apply_failed"), 1);
        assert!(target.get(&ns(), &DocumentKey::from_value(&Value::Int(2))).is_some());
    }

    #[tokio::test]
    async fn test_relay_applies_and_commits_checkpoint() {
        let (mut h, handle) = spawn_relay(u64::MAX);

        h.feed.push(memory_event(OperationKind::Insert, 1, Some(doc(1))));
        let last = h.feed.push(memory_event(OperationKind::Insert, 2, Some(doc(2))));

        h.checkpoint_rx
            .wait_for(|cp| cp.as_ref() == Some(&last))
            .await
            .unwrap();
        assert_eq!(h.target.document_count(&ns()), 2);

        h.shutdown_tx.send(true).unwrap();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.exit, ExitReason::Shutdown);
        assert_eq!(summary.events, 2);
        assert_eq!(summary.applied, 2);
        assert_eq!(summary.checkpoint, Some(last));
        assert_eq!(*h.state_rx.borrow(), EngineState::Stopped);
        assert_eq!(h.feed.open_handles(), 0);
        assert!(h.sink.count("batch_started") >= 1);
    }

    #[tokio::test]
    async fn test_relay_reports_lag_threshold() {
        let (mut h, handle) = spawn_relay(0);

        // Commit time 100s is decades behind the wall clock.
        let last = h.feed.push(memory_event(OperationKind::Insert, 1, Some(doc(1))));
        h.checkpoint_rx
            .wait_for(|cp| cp.as_ref() == Some(&last))
            .await
            .unwrap();

        h.shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(h.sink.count("lag_threshold_exceeded"), 1);
    }

    #[tokio::test]
    async fn test_relay_empty_polls_keep_waiting() {
        let (mut h, handle) = spawn_relay(u64::MAX);

        h.state_rx
            .wait_for(|s| *s == EngineState::FeedOpen)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert!(h.checkpoint_rx.borrow().is_none());

        h.shutdown_tx.send(true).unwrap();
        let summary = handle.await.unwrap().unwrap();
        assert!(summary.empty_polls >= 1);
        assert!(summary.checkpoint.is_none());
        assert!(h.sink.count("no_changes") >= 1);
    }

    #[tokio::test]
    async fn test_relay_end_of_feed() {
        let (h, handle) = spawn_relay(u64::MAX);

        h.feed.push(memory_event(OperationKind::Insert, 1, Some(doc(1))));
        h.feed.close();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.exit, ExitReason::EndOfFeed);
        assert_eq!(summary.applied, 1);
        assert_eq!(*h.state_rx.borrow(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_relay_fails_on_invalidation() {
        let (h, handle) = spawn_relay(u64::MAX);

        h.feed.inject_read_error(FeedError::Invalidated {
            reason: "history lost".into(),
        });

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(RelayError::FeedInvalidated { .. })));
        assert_eq!(*h.state_rx.borrow(), EngineState::Failed);
        assert_eq!(h.sink.count("feed_invalidated"), 1);
        assert_eq!(h.feed.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_relay_reports_unavailable_feed_to_sink() {
        let (h, handle) = spawn_relay(u64::MAX);

        for _ in 0..3 {
            h.feed.inject_read_error(FeedError::Transient("no primary".into()));
        }

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(RelayError::FeedUnavailable { attempts: 3, .. })));
        assert_eq!(*h.state_rx.borrow(), EngineState::Failed);

        let fatal: Vec<_> = h
            .sink
            .diagnostics()
            .into_iter()
            .filter(|d| d.severity() == crate::diagnostics::Severity::Error)
            .collect();
        assert_eq!(
            fatal,
            vec![Diagnostic::FeedUnavailable {
                checkpoint: None,
                attempts: 3,
                message: "no primary".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_relay_reconnects_after_transient_error() {
        let (mut h, handle) = spawn_relay(u64::MAX);

        h.feed.inject_read_error(FeedError::Transient("socket reset".into()));
        let last = h.feed.push(memory_event(OperationKind::Insert, 1, Some(doc(1))));

        h.checkpoint_rx
            .wait_for(|cp| cp.as_ref() == Some(&last))
            .await
            .unwrap();

        h.shutdown_tx.send(true).unwrap();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.reconnects, 1);
        assert_eq!(h.sink.count("feed_reconnecting"), 1);
        assert_eq!(h.target.document_count(&ns()), 1);
    }

    #[test]
    fn test_log_batch_result_empty() {
        log_batch_result("relay-1", &BatchSummary::default(), Duration::from_millis(10));
    }

    #[test]
    fn test_log_batch_result_with_failures() {
        let result = BatchSummary {
            total: 50,
            applied: 30,
            conflicts: 5,
            skipped: 5,
            failed: 10,
        };
        log_batch_result("relay-1", &result, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_persist_checkpoint_without_store() {
        let store: Arc<RwLock<Option<CheckpointStore>>> = Arc::new(RwLock::new(None));
        persist_checkpoint(&store, "relay-1", &ResumeToken::new("01")).await;
    }
}
