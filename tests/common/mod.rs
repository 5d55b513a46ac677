//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Change event builders for the in-memory feed
//! - A relay harness wiring feed, target and collecting sink together

#![allow(dead_code)]

use changefeed_relay::memory::{MemoryChangeFeed, MemoryEvent, MemoryTarget};
use changefeed_relay::{
    CollectingSink, Document, DocumentKey, EngineState, LogicalTime, Namespace, OperationKind,
    RelayConfig, ReplicationEngine, ResumeToken, Value,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type MemoryEngine = ReplicationEngine<MemoryChangeFeed, MemoryTarget>;

pub fn orders() -> Namespace {
    Namespace::new("shop", "orders")
}

pub fn key(id: i64) -> DocumentKey {
    DocumentKey::from_value(&Value::Int(id))
}

/// Cluster time `secs_ago` seconds before now.
pub fn recent(secs_ago: u32) -> LogicalTime {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as u32;
    LogicalTime::new(now - secs_ago, 1)
}

fn event(operation: OperationKind, id: i64, full_document: Option<Document>) -> MemoryEvent {
    MemoryEvent {
        operation,
        cluster_time: recent(1),
        namespace: orders(),
        document_key: Value::Int(id),
        full_document,
    }
}

/// `{_id: id}` plus the given fields.
pub fn doc(id: i64, fields: &[(&str, i64)]) -> Document {
    fields
        .iter()
        .fold(Document::new().with("_id", id), |d, (f, v)| d.with(*f, *v))
}

pub fn insert(id: i64, fields: &[(&str, i64)]) -> MemoryEvent {
    event(OperationKind::Insert, id, Some(doc(id, fields)))
}

pub fn update(id: i64, fields: &[(&str, i64)]) -> MemoryEvent {
    event(OperationKind::Update, id, Some(doc(id, fields)))
}

pub fn replace(id: i64, fields: &[(&str, i64)]) -> MemoryEvent {
    event(OperationKind::Replace, id, Some(doc(id, fields)))
}

/// Update whose post-image was not available.
pub fn update_without_post_image(id: i64) -> MemoryEvent {
    event(OperationKind::Update, id, None)
}

pub fn delete(id: i64) -> MemoryEvent {
    event(OperationKind::Delete, id, None)
}

pub fn other(operation: &str, id: i64) -> MemoryEvent {
    event(OperationKind::Other(operation.to_string()), id, None)
}

/// Engine over fresh in-memory collaborators.
pub struct Harness {
    pub feed: MemoryChangeFeed,
    pub target: MemoryTarget,
    pub sink: CollectingSink,
    pub engine: MemoryEngine,
}

impl Harness {
    pub fn new(relay_id: &str) -> Self {
        Self::with_config(RelayConfig::for_testing(relay_id))
    }

    pub fn with_config(config: RelayConfig) -> Self {
        Self::over(config, MemoryChangeFeed::new(), MemoryTarget::new())
    }

    /// Engine over existing collaborators (for restarts).
    pub fn over(config: RelayConfig, feed: MemoryChangeFeed, target: MemoryTarget) -> Self {
        let sink = CollectingSink::new();
        let engine = ReplicationEngine::new(config, Arc::new(feed.clone()), Arc::new(target.clone()))
            .with_sink(Arc::new(sink.clone()));
        Self {
            feed,
            target,
            sink,
            engine,
        }
    }

    /// Wait until the engine has committed `token`.
    pub async fn committed(&self, token: &ResumeToken) {
        let mut rx = self.engine.checkpoint_receiver();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|cp| cp.as_ref() == Some(token)),
        )
        .await
        .expect("checkpoint not committed in time")
        .expect("engine dropped checkpoint channel");
    }

    /// Wait until the engine reaches `state`.
    pub async fn reached(&self, state: EngineState) {
        let mut rx = self.engine.state_receiver();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached in time")
            .expect("engine dropped state channel");
    }
}
