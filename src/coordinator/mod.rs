// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relay engine coordinator.
//!
//! The orchestrator that ties together:
//! - Change feed reading via [`crate::feed::FeedReader`]
//! - Transactional writes via [`crate::applier::TransactionalApplier`]
//! - Checkpoint persistence via [`crate::checkpoint::CheckpointStore`]
//! - Operator diagnostics via [`crate::diagnostics::DiagnosticSink`]
//!
//! # Lifecycle
//!
//! 1. `new()` builds an idle engine around a source and a target
//! 2. `start()` resolves the start point and spawns the relay task
//! 3. `wait()` joins the task when the feed ends or fails
//! 4. `shutdown()` stops it, letting the in-flight batch drain first

mod relay_loop;
mod types;

pub use types::{BatchSummary, EngineState, ExitReason, RelaySummary};

use crate::applier::TransactionalApplier;
use crate::checkpoint::CheckpointStore;
use crate::config::RelayConfig;
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::error::{RelayError, Result};
use crate::event::ResumeToken;
use crate::feed::{ChangeFeed, FeedOptions, FeedReader, FeedStart};
use crate::target::TargetStore;
use relay_loop::{set_state, RelayContext};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `shutdown()` waits for the in-flight batch to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The relay engine.
///
/// Replays the change feed of `F` onto the target store `T`, one event at a
/// time, in feed order.
///
/// The engine only **reads** from the source and only **writes** to the
/// target. It never writes back to the source.
pub struct ReplicationEngine<F: ChangeFeed, T: TargetStore> {
    config: RelayConfig,

    /// Source change feed
    source: Arc<F>,

    /// Target store
    target: Arc<T>,

    /// Where diagnostics go (tracing unless overridden)
    sink: Arc<dyn DiagnosticSink>,

    /// Engine state (broadcast to watchers)
    state_tx: Arc<watch::Sender<EngineState>>,
    state_rx: watch::Receiver<EngineState>,

    /// Last committed checkpoint (broadcast to watchers)
    checkpoint_tx: Arc<watch::Sender<Option<ResumeToken>>>,
    checkpoint_rx: watch::Receiver<Option<ResumeToken>>,

    /// Durable checkpoint store, when configured
    checkpoint_store: Arc<RwLock<Option<CheckpointStore>>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Relay task handle
    relay_handle: Option<JoinHandle<Result<RelaySummary>>>,
}

impl<F: ChangeFeed, T: TargetStore> ReplicationEngine<F, T> {
    /// Create an idle engine. Diagnostics go to `tracing` by default.
    pub fn new(config: RelayConfig, source: Arc<F>, target: Arc<T>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Idle);
        let (checkpoint_tx, checkpoint_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            source,
            target,
            sink: Arc::new(TracingSink),
            state_tx: Arc::new(state_tx),
            state_rx,
            checkpoint_tx: Arc::new(checkpoint_tx),
            checkpoint_rx,
            checkpoint_store: Arc::new(RwLock::new(None)),
            shutdown_tx,
            shutdown_rx,
            relay_handle: None,
        }
    }

    /// Route diagnostics to `sink` instead of `tracing`.
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Last committed checkpoint.
    pub fn checkpoint(&self) -> Option<ResumeToken> {
        self.checkpoint_rx.borrow().clone()
    }

    /// Get a receiver to watch checkpoint commits.
    pub fn checkpoint_receiver(&self) -> watch::Receiver<Option<ResumeToken>> {
        self.checkpoint_rx.clone()
    }

    /// Check if the relay task is reading or draining.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::FeedOpen | EngineState::Draining)
    }

    pub fn relay_id(&self) -> &str {
        &self.config.relay_id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Start relaying.
    ///
    /// 1. Validates the configuration
    /// 2. Opens the checkpoint store (if configured) and loads the stored token
    /// 3. Resumes after the stored token, or at the configured start time
    /// 4. Spawns the relay task
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Idle {
            return Err(RelayError::InvalidState {
                expected: "Idle".to_string(),
                actual: self.state().to_string(),
            });
        }

        if let Err(e) = self.config.validate() {
            error!(error = %e, "Refusing to start with invalid configuration");
            set_state(&self.state_tx, EngineState::Failed);
            return Err(e);
        }
        let apply_timeout = self.config.apply.timeout_duration()?;

        info!(
            relay_id = %self.config.relay_id,
            batch_size = self.config.feed.batch_size,
            apply_timeout_ms = apply_timeout.as_millis(),
            "Starting relay engine"
        );

        let stored = match self.open_checkpoint_store().await {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, "Failed to open checkpoint store");
                set_state(&self.state_tx, EngineState::Failed);
                return Err(e);
            }
        };

        let start = match stored {
            Some(token) => {
                info!(token = %token, "Resuming after stored checkpoint");
                let _ = self.checkpoint_tx.send(Some(token.clone()));
                FeedStart::After(token)
            }
            None => {
                let time = self.config.feed.start_time(SystemTime::now());
                info!(start_time = %time, "No stored checkpoint, starting at configured time");
                FeedStart::At(time)
            }
        };

        let reader = FeedReader::new(
            Arc::clone(&self.source),
            FeedOptions {
                start,
                batch_size: self.config.feed.batch_size,
                max_await: self.config.feed.max_await_duration(),
                include_post_image: self.config.feed.include_post_image,
            },
            self.config.feed.retry_config(),
        );

        let ctx = RelayContext {
            relay_id: self.config.relay_id.clone(),
            applier: TransactionalApplier::new(Arc::clone(&self.target), apply_timeout),
            sink: Arc::clone(&self.sink),
            slo: self.config.slo.clone(),
            checkpoint_store: Arc::clone(&self.checkpoint_store),
            state_tx: Arc::clone(&self.state_tx),
            checkpoint_tx: Arc::clone(&self.checkpoint_tx),
        };

        set_state(&self.state_tx, EngineState::FeedOpen);
        let shutdown_rx = self.shutdown_rx.clone();
        self.relay_handle = Some(tokio::spawn(relay_loop::run_relay(reader, ctx, shutdown_rx)));
        debug!("Spawned relay task");

        Ok(())
    }

    async fn open_checkpoint_store(&self) -> Result<Option<ResumeToken>> {
        let Some(path) = &self.config.checkpoint.sqlite_path else {
            return Ok(None);
        };
        let store = CheckpointStore::new(path).await?;
        let stored = store.load(&self.config.relay_id).await;
        *self.checkpoint_store.write().await = Some(store);
        info!(path = %path, "Checkpoint store initialized");
        Ok(stored)
    }

    /// Forget the stored checkpoint so the next run begins at the configured start time.
    ///
    /// This is the operator's way out of `FeedInvalidated`. Only valid while the
    /// relay task is not running.
    pub async fn reset_checkpoint(&mut self) -> Result<()> {
        if self.relay_handle.is_some() || self.is_running() {
            return Err(RelayError::InvalidState {
                expected: "not running".to_string(),
                actual: self.state().to_string(),
            });
        }

        if let Some(path) = &self.config.checkpoint.sqlite_path {
            let store = CheckpointStore::new(path).await?;
            let result = store.delete(&self.config.relay_id).await;
            store.close().await;
            result?;
        }

        let _ = self.checkpoint_tx.send(None);
        warn!(relay_id = %self.config.relay_id, "Checkpoint reset, next start uses the configured start time");
        Ok(())
    }

    /// Wait for the relay task to finish on its own (end of feed or fatal error).
    pub async fn wait(&mut self) -> Result<RelaySummary> {
        let Some(handle) = self.relay_handle.take() else {
            return Err(RelayError::InvalidState {
                expected: "started".to_string(),
                actual: self.state().to_string(),
            });
        };

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Relay task panicked");
                set_state(&self.state_tx, EngineState::Failed);
                Err(RelayError::Internal(format!("relay task panicked: {}", e)))
            }
        };

        self.close_checkpoint_store().await;
        result
    }

    /// Shutdown the engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal the relay task to stop
    /// 2. Wait for the in-flight batch to drain (with timeout)
    /// 3. Close the checkpoint store
    ///
    /// Shutting down an engine that never started just marks it `Stopped`.
    pub async fn shutdown(&mut self) -> Result<RelaySummary> {
        info!("Shutting down relay engine");
        let _ = self.shutdown_tx.send(true);

        let result = match self.relay_handle.take() {
            None => {
                if self.state() == EngineState::Idle {
                    set_state(&self.state_tx, EngineState::Stopped);
                }
                Ok(RelaySummary::new(ExitReason::Shutdown))
            }
            Some(mut handle) => match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(result)) => {
                    debug!("Relay task completed gracefully");
                    result
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Relay task panicked during shutdown");
                    set_state(&self.state_tx, EngineState::Failed);
                    Err(RelayError::Internal(format!("relay task panicked: {}", e)))
                }
                Err(_) => {
                    warn!(
                        grace_secs = SHUTDOWN_GRACE.as_secs(),
                        "Relay task did not drain in time, aborting (batch will be replayed)"
                    );
                    handle.abort();
                    set_state(&self.state_tx, EngineState::Stopped);
                    let mut summary = RelaySummary::new(ExitReason::Aborted);
                    summary.checkpoint = self.checkpoint();
                    Ok(summary)
                }
            },
        };

        self.close_checkpoint_store().await;
        info!("Relay engine stopped");
        result
    }

    /// Close checkpoint store (includes WAL checkpoint).
    async fn close_checkpoint_store(&self) {
        if let Some(store) = self.checkpoint_store.write().await.take() {
            store.close().await;
        }
    }
}

impl<F: ChangeFeed, T: TargetStore> Drop for ReplicationEngine<F, T> {
    fn drop(&mut self) {
        if self.relay_handle.is_some() {
            let _ = self.shutdown_tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckpointConfig;
    use crate::diagnostics::CollectingSink;
    use crate::document::{Document, Namespace, Value};
    use crate::event::{LogicalTime, OperationKind};
    use crate::memory::{MemoryChangeFeed, MemoryEvent, MemoryTarget};
    use tempfile::tempdir;

    fn test_engine() -> (
        ReplicationEngine<MemoryChangeFeed, MemoryTarget>,
        MemoryChangeFeed,
        MemoryTarget,
    ) {
        let feed = MemoryChangeFeed::new();
        let target = MemoryTarget::new();
        let engine = ReplicationEngine::new(
            RelayConfig::for_testing("test-relay"),
            Arc::new(feed.clone()),
            Arc::new(target.clone()),
        );
        (engine, feed, target)
    }

    fn insert(id: i64) -> MemoryEvent {
        MemoryEvent {
            operation: OperationKind::Insert,
            cluster_time: LogicalTime::new(1_000, 1),
            namespace: Namespace::new("shop", "orders"),
            document_key: Value::Int(id),
            full_document: Some(Document::new().with("_id", id)),
        }
    }

    #[test]
    fn test_engine_initial_state() {
        let (engine, _, _) = test_engine();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!engine.is_running());
        assert_eq!(engine.relay_id(), "test-relay");
        assert!(engine.checkpoint().is_none());
    }

    #[test]
    fn test_engine_state_receiver() {
        let (engine, _, _) = test_engine();
        let state_rx = engine.state_receiver();
        assert_eq!(*state_rx.borrow(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_engine_start_invalid_state() {
        let (mut engine, _, _) = test_engine();

        // Force state to Draining (simulating already started)
        let _ = engine.state_tx.send(EngineState::Draining);

        let result = engine.start().await;
        if let Err(RelayError::InvalidState { expected, actual }) = result {
            assert_eq!(expected, "Idle");
            assert_eq!(actual, "Draining");
        } else {
            panic!("Expected InvalidState error");
        }
    }

    #[tokio::test]
    async fn test_engine_start_twice_fails() {
        let (mut engine, _, _) = test_engine();
        engine.start().await.unwrap();
        assert!(matches!(engine.start().await, Err(RelayError::InvalidState { .. })));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_engine_rejects_invalid_config() {
        let mut config = RelayConfig::for_testing("bad");
        config.feed.batch_size = 0;
        let mut engine = ReplicationEngine::new(
            config,
            Arc::new(MemoryChangeFeed::new()),
            Arc::new(MemoryTarget::new()),
        );
        assert!(matches!(engine.start().await, Err(RelayError::Config(_))));
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[tokio::test]
    async fn test_engine_shutdown_from_idle() {
        let (mut engine, _, _) = test_engine();
        let summary = engine.shutdown().await.unwrap();
        assert_eq!(summary.exit, ExitReason::Shutdown);
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_wait_without_start_fails() {
        let (mut engine, _, _) = test_engine();
        assert!(matches!(engine.wait().await, Err(RelayError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_engine_relays_until_end_of_feed() {
        let (engine, feed, target) = test_engine();
        let sink = CollectingSink::new();
        let mut engine = engine.with_sink(Arc::new(sink.clone()));

        feed.push(insert(1));
        let last = feed.push(insert(2));
        feed.close();

        engine.start().await.unwrap();
        let summary = engine.wait().await.unwrap();

        assert_eq!(summary.exit, ExitReason::EndOfFeed);
        assert_eq!(summary.applied, 2);
        assert_eq!(engine.checkpoint(), Some(last));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(target.document_count(&Namespace::new("shop", "orders")), 2);
        assert!(sink.count("batch_started") >= 1);
    }

    #[tokio::test]
    async fn test_reset_checkpoint_refused_while_running() {
        let (mut engine, _, _) = test_engine();
        engine.start().await.unwrap();
        assert!(matches!(
            engine.reset_checkpoint().await,
            Err(RelayError::InvalidState { .. })
        ));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_checkpoint_without_store_clears_memory() {
        let (mut engine, feed, _) = test_engine();
        let last = feed.push(insert(1));
        feed.close();
        engine.start().await.unwrap();
        engine.wait().await.unwrap();
        assert_eq!(engine.checkpoint(), Some(last));

        engine.reset_checkpoint().await.unwrap();
        assert!(engine.checkpoint().is_none());
    }

    #[tokio::test]
    async fn test_engine_resumes_from_stored_checkpoint() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("relay.db").to_string_lossy().to_string();

        let feed = MemoryChangeFeed::new();
        let target = MemoryTarget::new();
        let mut config = RelayConfig::for_testing("durable");
        config.checkpoint = CheckpointConfig::sqlite(db_path.clone());

        let first = feed.push(insert(1));
        {
            let mut engine =
                ReplicationEngine::new(config.clone(), Arc::new(feed.clone()), Arc::new(target.clone()));
            engine.start().await.unwrap();
            let mut checkpoint_rx = engine.checkpoint_receiver();
            checkpoint_rx
                .wait_for(|cp| cp.as_ref() == Some(&first))
                .await
                .unwrap();
            engine.shutdown().await.unwrap();
        }

        feed.push(insert(2));
        feed.close();

        let mut engine = ReplicationEngine::new(config, Arc::new(feed.clone()), Arc::new(target.clone()));
        engine.start().await.unwrap();
        let summary = engine.wait().await.unwrap();

        // Only the event after the stored checkpoint is replayed.
        assert_eq!(summary.events, 1);
        assert_eq!(target.commits().len(), 2);
    }
}
