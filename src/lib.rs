//! # Changefeed Relay
//!
//! A one-directional relay that tails a document store's change feed and
//! replays every insert, update, replace and delete onto a target store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            changefeed-relay                              │
//! │                                                                          │
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────┐   ┌──────────────┐   │
//! │  │ FeedReader │──►│ translate  │──►│ Transactional│──►│  classifier  │   │
//! │  │ (batches)  │   │ (mutation) │   │ Applier      │   │ (diagnostic) │   │
//! │  └────────────┘   └────────────┘   └──────────────┘   └──────────────┘   │
//! │        │                                                      │          │
//! │        ▼                                                      ▼          │
//! │  ┌─────────────────┐                               ┌──────────────────┐  │
//! │  │ CheckpointStore │                               │  DiagnosticSink  │  │
//! │  │ (SQLite, opt.)  │                               │  (tracing)       │  │
//! │  └─────────────────┘                               └──────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery
//!
//! Events are applied strictly in feed order, one transaction each. The
//! checkpoint advances only after a whole batch is processed, so a crash
//! replays at most one batch. Replays converge because every mutation is
//! idempotent: duplicate inserts are ignored, deletes of missing documents
//! succeed, and updates are full-document upserts.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use changefeed_relay::memory::{MemoryChangeFeed, MemoryTarget};
//! use changefeed_relay::{RelayConfig, ReplicationEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RelayConfig::default();
//!     let source = Arc::new(MemoryChangeFeed::new());
//!     let target = Arc::new(MemoryTarget::new());
//!
//!     let mut engine = ReplicationEngine::new(config, source, target);
//!     engine.start().await.expect("Failed to start");
//!
//!     // Engine runs until shutdown signal
//!     let summary = engine.shutdown().await.expect("Relay failed");
//!     println!("relayed {} events", summary.events);
//! }
//! ```

pub mod applier;
pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod document;
pub mod error;
pub mod event;
pub mod feed;
pub mod lag;
pub mod memory;
pub mod metrics;
pub mod resilience;
pub mod target;
pub mod translate;

// Re-exports for convenience
pub use applier::{ApplyFailure, ApplyOutcome, FailureReason, TransactionalApplier};
pub use checkpoint::CheckpointStore;
pub use classifier::{classify, Action, Verdict};
pub use config::{ApplyConfig, CheckpointConfig, FeedConfig, RelayConfig, SloConfig};
pub use coordinator::{BatchSummary, EngineState, ExitReason, RelaySummary, ReplicationEngine};
pub use diagnostics::{CollectingSink, Diagnostic, DiagnosticSink, Severity, TracingSink};
pub use document::{Document, DocumentKey, Namespace, Value};
pub use error::{RelayError, Result};
pub use event::{ChangeEvent, LogicalTime, OperationKind, ResumeToken};
pub use feed::{ChangeFeed, FeedBatch, FeedError, FeedHandle, FeedOptions, FeedReader, FeedStart};
pub use target::{TargetError, TargetSession, TargetStore};
pub use translate::{translate, MutationKind, SkipReason, TargetMutation};
