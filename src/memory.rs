// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process implementations of the source and target collaborators.
//!
//! [`MemoryChangeFeed`] is an append-only log with retention truncation;
//! [`MemoryTarget`] is a set of keyed collections with single-session
//! transactions. Both are cheap to clone (shared state) and support fault and
//! latency injection, which is what the relay's own tests run against.
//!
//! # Feed Positions
//!
//! Every pushed event gets a monotonically increasing position, exposed as a
//! fixed-width hex [`ResumeToken`] (`{:016x}`), so token order is feed order.

use crate::document::{Document, DocumentKey, Namespace, Value};
use crate::event::{ChangeEvent, LogicalTime, OperationKind, ResumeToken};
use crate::feed::{ChangeFeed, FeedBatch, FeedError, FeedFuture, FeedHandle, FeedOptions, FeedStart};
use crate::target::{TargetError, TargetFuture, TargetSession, TargetStore};
use crate::translate::MutationKind;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn position_token(position: u64) -> ResumeToken {
    ResumeToken::new(format!("{:016x}", position))
}

fn token_position(token: &ResumeToken) -> Option<u64> {
    u64::from_str_radix(token.as_str(), 16).ok()
}

// =============================================================================
// Change feed
// =============================================================================

/// Event to append to a [`MemoryChangeFeed`]. The feed assigns the token.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEvent {
    pub operation: OperationKind,
    pub cluster_time: LogicalTime,
    pub namespace: Namespace,
    pub document_key: Value,
    pub full_document: Option<Document>,
}

#[derive(Default)]
struct FeedState {
    /// Retained events with their positions, oldest first.
    events: VecDeque<(u64, ChangeEvent)>,
    last_position: u64,
    /// Highest position removed by truncation (0 = nothing removed).
    truncated_position: u64,
    /// Cluster time of the newest truncated event.
    truncated_time: Option<LogicalTime>,
    closed: bool,
    open_errors: VecDeque<FeedError>,
    read_errors: VecDeque<FeedError>,
    post_batch_tokens: bool,
}

#[derive(Default)]
struct FeedInner {
    state: Mutex<FeedState>,
    notify: Notify,
    open_handles: AtomicUsize,
    opens: AtomicUsize,
}

/// Append-only in-memory change feed.
#[derive(Clone, Default)]
pub struct MemoryChangeFeed {
    inner: Arc<FeedInner>,
}

impl MemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and wake waiting handles. Returns its token.
    pub fn push(&self, event: MemoryEvent) -> ResumeToken {
        let token = {
            let mut state = lock(&self.inner.state);
            state.last_position += 1;
            let position = state.last_position;
            let token = position_token(position);
            state.events.push_back((
                position,
                ChangeEvent {
                    resume_token: token.clone(),
                    operation: event.operation,
                    cluster_time: event.cluster_time,
                    namespace: event.namespace,
                    document_key: event.document_key,
                    full_document: event.full_document,
                },
            ));
            token
        };
        self.inner.notify.notify_waiters();
        token
    }

    /// Drop retained events whose cluster time is before `time`.
    ///
    /// Handles and opens that still need a dropped event become invalidated.
    pub fn truncate_before(&self, time: LogicalTime) {
        let mut state = lock(&self.inner.state);
        while let Some((position, event)) = state.events.front() {
            if event.cluster_time >= time {
                break;
            }
            let (position, cluster_time) = (*position, event.cluster_time);
            state.events.pop_front();
            state.truncated_position = position;
            state.truncated_time = Some(cluster_time);
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Mark the feed finished. Handles drain what is left, then report end of feed.
    pub fn close(&self) {
        lock(&self.inner.state).closed = true;
        self.inner.notify.notify_waiters();
    }

    /// Fail the next `open` call with `error`. Queued errors fire in order.
    pub fn inject_open_error(&self, error: FeedError) {
        lock(&self.inner.state).open_errors.push_back(error);
    }

    /// Fail the next `next_batch` call on any handle with `error`.
    pub fn inject_read_error(&self, error: FeedError) {
        lock(&self.inner.state).read_errors.push_back(error);
        self.inner.notify.notify_waiters();
    }

    /// Attach a post-batch token to every non-empty batch.
    pub fn set_post_batch_tokens(&self, enabled: bool) {
        lock(&self.inner.state).post_batch_tokens = enabled;
    }

    /// Handles currently open.
    pub fn open_handles(&self) -> usize {
        self.inner.open_handles.load(Ordering::SeqCst)
    }

    /// Total successful opens.
    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Retained event count.
    pub fn len(&self) -> usize {
        lock(&self.inner.state).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn start_position(state: &FeedState, start: &FeedStart) -> Result<u64, FeedError> {
        match start {
            FeedStart::At(time) => {
                if state.truncated_time.is_some_and(|t| t > *time) {
                    return Err(FeedError::Invalidated {
                        reason: format!("start time {} is older than retained history", time),
                    });
                }
                Ok(state
                    .events
                    .iter()
                    .take_while(|(_, e)| e.cluster_time <= *time)
                    .last()
                    .map(|(position, _)| *position)
                    .unwrap_or(state.truncated_position))
            }
            FeedStart::After(token) => {
                let position = token_position(token).ok_or_else(|| FeedError::Invalidated {
                    reason: format!("unrecognised resume token {}", token),
                })?;
                if position < state.truncated_position {
                    return Err(FeedError::Invalidated {
                        reason: format!("resume token {} is older than retained history", token),
                    });
                }
                if position > state.last_position {
                    return Err(FeedError::Invalidated {
                        reason: format!("resume token {} is ahead of the feed", token),
                    });
                }
                Ok(position)
            }
        }
    }
}

impl ChangeFeed for MemoryChangeFeed {
    type Handle = MemoryFeedHandle;

    fn open(&self, options: FeedOptions) -> FeedFuture<'_, MemoryFeedHandle> {
        Box::pin(async move {
            let position = {
                let mut state = lock(&self.inner.state);
                if let Some(error) = state.open_errors.pop_front() {
                    return Err(error);
                }
                Self::start_position(&state, &options.start)?
            };
            self.inner.opens.fetch_add(1, Ordering::SeqCst);
            self.inner.open_handles.fetch_add(1, Ordering::SeqCst);
            Ok(MemoryFeedHandle {
                inner: Arc::clone(&self.inner),
                position,
                batch_size: options.batch_size.max(1),
                max_await: options.max_await,
            })
        })
    }
}

/// Open cursor on a [`MemoryChangeFeed`].
pub struct MemoryFeedHandle {
    inner: Arc<FeedInner>,
    /// Last delivered position.
    position: u64,
    batch_size: usize,
    max_await: Duration,
}

impl FeedHandle for MemoryFeedHandle {
    fn next_batch(&mut self) -> FeedFuture<'_, Option<FeedBatch>> {
        Box::pin(async move {
            let inner = Arc::clone(&self.inner);
            let deadline = tokio::time::Instant::now() + self.max_await;
            loop {
                let notified = inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    let mut state = lock(&inner.state);
                    if let Some(error) = state.read_errors.pop_front() {
                        return Err(error);
                    }
                    if self.position < state.truncated_position {
                        return Err(FeedError::Invalidated {
                            reason: format!(
                                "position {} fell out of retained history",
                                position_token(self.position)
                            ),
                        });
                    }
                    let position = self.position;
                    let events: Vec<ChangeEvent> = state
                        .events
                        .iter()
                        .filter(|(p, _)| *p > position)
                        .take(self.batch_size)
                        .map(|(_, e)| e.clone())
                        .collect();
                    if let Some(last) = events.last() {
                        self.position = token_position(&last.resume_token).unwrap_or(position);
                        let post_batch_token = state
                            .post_batch_tokens
                            .then(|| position_token(self.position));
                        return Ok(Some(FeedBatch {
                            events,
                            post_batch_token,
                        }));
                    }
                    if state.closed {
                        return Ok(None);
                    }
                }

                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(Some(FeedBatch::default()));
                }
            }
        })
    }
}

impl Drop for MemoryFeedHandle {
    fn drop(&mut self) {
        self.inner.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Target store
// =============================================================================

/// One committed write, in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedWrite {
    pub namespace: Namespace,
    pub kind: MutationKind,
    pub key: DocumentKey,
}

#[derive(Debug, Clone)]
enum Staged {
    Put(Namespace, DocumentKey, Document, MutationKind),
    Delete(Namespace, DocumentKey),
}

#[derive(Default)]
struct TargetState {
    collections: HashMap<Namespace, BTreeMap<DocumentKey, Document>>,
    commits: Vec<CommittedWrite>,
    session_failures: VecDeque<TargetError>,
    write_failures: VecDeque<TargetError>,
    commit_failures: VecDeque<TargetError>,
    write_latency: Duration,
    slow_keys: HashMap<DocumentKey, Duration>,
}

impl TargetState {
    /// Whether `key` exists as seen from inside a transaction with `staged` writes.
    fn visible(&self, staged: &[Staged], namespace: &Namespace, key: &DocumentKey) -> bool {
        let mut exists = self
            .collections
            .get(namespace)
            .is_some_and(|c| c.contains_key(key));
        for write in staged {
            match write {
                Staged::Put(ns, k, _, _) if ns == namespace && k == key => exists = true,
                Staged::Delete(ns, k) if ns == namespace && k == key => exists = false,
                _ => {}
            }
        }
        exists
    }

    fn latency_for(&self, key: &DocumentKey) -> Duration {
        self.slow_keys.get(key).copied().unwrap_or(self.write_latency)
    }
}

#[derive(Default)]
struct TargetInner {
    state: Mutex<TargetState>,
    sessions_started: AtomicUsize,
    aborts: AtomicUsize,
}

/// Keyed in-memory document collections with transactional sessions.
#[derive(Clone, Default)]
pub struct MemoryTarget {
    inner: Arc<TargetInner>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document outside any transaction.
    pub fn seed(&self, namespace: &Namespace, document: Document) -> Option<DocumentKey> {
        let key = document.key()?;
        lock(&self.inner.state)
            .collections
            .entry(namespace.clone())
            .or_default()
            .insert(key.clone(), document);
        Some(key)
    }

    pub fn get(&self, namespace: &Namespace, key: &DocumentKey) -> Option<Document> {
        lock(&self.inner.state)
            .collections
            .get(namespace)
            .and_then(|c| c.get(key))
            .cloned()
    }

    pub fn document_count(&self, namespace: &Namespace) -> usize {
        lock(&self.inner.state)
            .collections
            .get(namespace)
            .map_or(0, |c| c.len())
    }

    /// Committed writes in commit order.
    pub fn commits(&self) -> Vec<CommittedWrite> {
        lock(&self.inner.state).commits.clone()
    }

    pub fn sessions_started(&self) -> usize {
        self.inner.sessions_started.load(Ordering::SeqCst)
    }

    /// Transactions aborted (open transactions only).
    pub fn aborts(&self) -> usize {
        self.inner.aborts.load(Ordering::SeqCst)
    }

    /// Fail the next `start_session` with `error`.
    pub fn fail_next_session(&self, error: TargetError) {
        lock(&self.inner.state).session_failures.push_back(error);
    }

    /// Fail the next write primitive (insert, delete or upsert) with `error`.
    pub fn fail_next_write(&self, error: TargetError) {
        lock(&self.inner.state).write_failures.push_back(error);
    }

    /// Fail the next commit with `error`.
    pub fn fail_next_commit(&self, error: TargetError) {
        lock(&self.inner.state).commit_failures.push_back(error);
    }

    /// Delay every write primitive by `latency`.
    pub fn set_write_latency(&self, latency: Duration) {
        lock(&self.inner.state).write_latency = latency;
    }

    /// Delay writes addressing `key` by `latency`, overriding the global latency.
    pub fn set_key_latency(&self, key: DocumentKey, latency: Duration) {
        lock(&self.inner.state).slow_keys.insert(key, latency);
    }
}

impl TargetStore for MemoryTarget {
    type Session = MemorySession;

    fn start_session(&self) -> TargetFuture<'_, MemorySession> {
        Box::pin(async move {
            if let Some(error) = lock(&self.inner.state).session_failures.pop_front() {
                return Err(error);
            }
            self.inner.sessions_started.fetch_add(1, Ordering::SeqCst);
            Ok(MemorySession {
                inner: Arc::clone(&self.inner),
                transaction: None,
            })
        })
    }
}

/// Session on a [`MemoryTarget`]. Writes are staged until commit.
pub struct MemorySession {
    inner: Arc<TargetInner>,
    transaction: Option<Vec<Staged>>,
}

impl MemorySession {
    /// Injected latency and failure for one write primitive.
    async fn before_write(&self, key: &DocumentKey) -> Result<(), TargetError> {
        let latency = {
            let mut state = lock(&self.inner.state);
            if let Some(error) = state.write_failures.pop_front() {
                return Err(error);
            }
            state.latency_for(key)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn staged(&mut self) -> Result<&mut Vec<Staged>, TargetError> {
        self.transaction
            .as_mut()
            .ok_or_else(|| TargetError::Rejected("no transaction in progress".to_string()))
    }
}

impl TargetSession for MemorySession {
    fn begin_transaction(&mut self) -> TargetFuture<'_, ()> {
        Box::pin(async move {
            if self.transaction.is_some() {
                return Err(TargetError::Rejected("transaction already in progress".to_string()));
            }
            self.transaction = Some(Vec::new());
            Ok(())
        })
    }

    fn insert_one<'a>(&'a mut self, namespace: &'a Namespace, document: Document) -> TargetFuture<'a, ()> {
        Box::pin(async move {
            let key = document
                .key()
                .ok_or_else(|| TargetError::Rejected("document has no _id".to_string()))?;
            self.before_write(&key).await?;
            let inner = Arc::clone(&self.inner);
            let staged = self.staged()?;
            if lock(&inner.state).visible(staged, namespace, &key) {
                return Err(TargetError::DuplicateKey {
                    namespace: namespace.clone(),
                    key,
                });
            }
            staged.push(Staged::Put(namespace.clone(), key, document, MutationKind::Insert));
            Ok(())
        })
    }

    fn delete_by_key<'a>(
        &'a mut self,
        namespace: &'a Namespace,
        key: &'a DocumentKey,
    ) -> TargetFuture<'a, bool> {
        Box::pin(async move {
            self.before_write(key).await?;
            let inner = Arc::clone(&self.inner);
            let staged = self.staged()?;
            let existed = lock(&inner.state).visible(staged, namespace, key);
            staged.push(Staged::Delete(namespace.clone(), key.clone()));
            Ok(existed)
        })
    }

    fn upsert_by_key<'a>(
        &'a mut self,
        namespace: &'a Namespace,
        key: &'a DocumentKey,
        document: Document,
    ) -> TargetFuture<'a, ()> {
        Box::pin(async move {
            self.before_write(key).await?;
            let staged = self.staged()?;
            staged.push(Staged::Put(namespace.clone(), key.clone(), document, MutationKind::Upsert));
            Ok(())
        })
    }

    fn commit_transaction(&mut self) -> TargetFuture<'_, ()> {
        Box::pin(async move {
            let mut state = lock(&self.inner.state);
            if let Some(error) = state.commit_failures.pop_front() {
                return Err(error);
            }
            let staged = self
                .transaction
                .take()
                .ok_or_else(|| TargetError::Rejected("no transaction in progress".to_string()))?;
            for write in staged {
                match write {
                    Staged::Put(namespace, key, document, kind) => {
                        state
                            .collections
                            .entry(namespace.clone())
                            .or_default()
                            .insert(key.clone(), document);
                        state.commits.push(CommittedWrite { namespace, kind, key });
                    }
                    Staged::Delete(namespace, key) => {
                        if let Some(collection) = state.collections.get_mut(&namespace) {
                            collection.remove(&key);
                        }
                        state.commits.push(CommittedWrite {
                            namespace,
                            kind: MutationKind::Delete,
                            key,
                        });
                    }
                }
            }
            Ok(())
        })
    }

    fn abort_transaction(&mut self) -> TargetFuture<'_, ()> {
        Box::pin(async move {
            if self.transaction.take().is_some() {
                self.inner.aborts.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }
}
