// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change feed consumer.
//!
//! Opens the source feed strictly after a start point, pulls batches and owns
//! the relay's only mutable position: the checkpoint.
//!
//! # Checkpoints
//!
//! A non-empty batch carries one checkpoint: the source's post-batch token
//! when it supplies one, otherwise the token of the last event. The reader
//! hands it out with the batch but only adopts it when the caller reports the
//! batch as processed via [`FeedReader::advance`]. Empty batches never move it.
//!
//! # Failure Handling
//!
//! | Source error | Reader behaviour |
//! |--------------|------------------|
//! | `Invalidated` | Drop handle, return `RelayError::FeedInvalidated` (fatal) |
//! | `Transient` | Drop handle, return `FeedRead::Reconnecting`; next call reopens after the checkpoint |
//! | `Transient` × `max_attempts` | Return `RelayError::FeedUnavailable` (fatal) |
//!
//! The handle releases the source cursor when dropped, so every exit path
//! (shutdown, fatal error, reopen, cancelled future) releases it.

use crate::error::{RelayError, Result};
use crate::event::{ChangeEvent, LogicalTime, ResumeToken};
use crate::metrics;
use crate::resilience::RetryConfig;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Type alias for boxed async futures returned by feed sources.
pub type FeedFuture<'a, T> = Pin<Box<dyn Future<Output = std::result::Result<T, FeedError>> + Send + 'a>>;

/// Failures reported by the source feed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    /// The source can no longer serve events from the requested position.
    #[error("feed invalidated: {reason}")]
    Invalidated { reason: String },

    /// Network blip, election, cursor killed. Reopening may succeed.
    #[error("transient feed error: {0}")]
    Transient(String),
}

impl From<FeedError> for RelayError {
    fn from(e: FeedError) -> Self {
        match e {
            FeedError::Invalidated { reason } => RelayError::FeedInvalidated {
                checkpoint: None,
                reason,
            },
            FeedError::Transient(message) => RelayError::feed("read", message),
        }
    }
}

/// Where a freshly opened feed begins. Delivery is strictly after the point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStart {
    /// Events whose cluster time is after this logical time.
    At(LogicalTime),
    /// Events after this token.
    After(ResumeToken),
}

impl fmt::Display for FeedStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedStart::At(t) => write!(f, "time {}", t),
            FeedStart::After(token) => write!(f, "token {}", token),
        }
    }
}

/// Parameters passed to [`ChangeFeed::open`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeedOptions {
    pub start: FeedStart,
    /// Maximum events per batch.
    pub batch_size: usize,
    /// How long the source may wait for new events before returning an empty batch.
    pub max_await: Duration,
    /// Ask the source to attach the post-image to update events.
    pub include_post_image: bool,
}

/// One batch from the source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedBatch {
    pub events: Vec<ChangeEvent>,
    /// Position after this batch, when the source reports one.
    pub post_batch_token: Option<ResumeToken>,
}

impl FeedBatch {
    /// The batch's single checkpoint: post-batch token, else the last event's token.
    pub fn checkpoint(&self) -> Option<ResumeToken> {
        self.post_batch_token
            .clone()
            .or_else(|| self.events.last().map(|e| e.resume_token.clone()))
    }
}

/// Trait defining what we need from the source change feed.
pub trait ChangeFeed: Send + Sync + 'static {
    type Handle: FeedHandle;

    /// Open a feed cursor at `options.start`.
    fn open(&self, options: FeedOptions) -> FeedFuture<'_, Self::Handle>;
}

/// Open feed cursor. Dropping it releases the cursor on the source.
pub trait FeedHandle: Send + 'static {
    /// Wait up to `max_await` for the next batch.
    ///
    /// `Ok(None)` means the feed has ended and will never produce more events.
    fn next_batch(&mut self) -> FeedFuture<'_, Option<FeedBatch>>;
}

/// Result of one [`FeedReader::next_batch`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedRead {
    /// Non-empty batch, with the checkpoint to commit once it is processed.
    Batch {
        events: Vec<ChangeEvent>,
        checkpoint: ResumeToken,
    },
    /// Nothing new within `max_await`.
    Empty,
    /// The source closed the feed.
    EndOfFeed,
    /// A transient error dropped the handle. Wait `delay`, then call again.
    Reconnecting {
        attempt: usize,
        delay: Duration,
        reason: String,
    },
}

/// Reads a change feed with checkpoint tracking and reconnect.
pub struct FeedReader<F: ChangeFeed> {
    source: Arc<F>,
    options: FeedOptions,
    handle: Option<F::Handle>,
    checkpoint: Option<ResumeToken>,
    retry: RetryConfig,
    /// Consecutive transient failures since the last good read.
    failures: usize,
}

impl<F: ChangeFeed> FeedReader<F> {
    /// Create a reader. Nothing is opened until the first `next_batch`.
    ///
    /// A `FeedStart::After` start point doubles as the initial checkpoint.
    pub fn new(source: Arc<F>, options: FeedOptions, retry: RetryConfig) -> Self {
        let checkpoint = match &options.start {
            FeedStart::After(token) => Some(token.clone()),
            FeedStart::At(_) => None,
        };
        Self {
            source,
            options,
            handle: None,
            checkpoint,
            retry,
            failures: 0,
        }
    }

    /// Last committed checkpoint.
    pub fn checkpoint(&self) -> Option<&ResumeToken> {
        self.checkpoint.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Where the next open would begin.
    pub fn resume_point(&self) -> FeedStart {
        match &self.checkpoint {
            Some(token) => FeedStart::After(token.clone()),
            None => self.options.start.clone(),
        }
    }

    /// Commit `token` as processed. Tokens never move backwards.
    pub fn advance(&mut self, token: ResumeToken) {
        match &self.checkpoint {
            Some(current) if *current >= token => {
                trace!(current = %current, token = %token, "Ignoring non-advancing checkpoint");
            }
            _ => self.checkpoint = Some(token),
        }
    }

    /// Release the source cursor.
    pub fn close(&mut self) {
        if self.handle.take().is_some() {
            debug!("Feed handle released");
        }
    }

    /// Pull the next batch, opening or reopening the feed as needed.
    pub async fn next_batch(&mut self) -> Result<FeedRead> {
        if self.handle.is_none() {
            let options = FeedOptions {
                start: self.resume_point(),
                ..self.options.clone()
            };
            let start = options.start.clone();
            match self.source.open(options).await {
                Ok(handle) => {
                    info!(start = %start, batch_size = self.options.batch_size, "Change feed opened");
                    self.handle = Some(handle);
                }
                Err(e) => return self.on_error(e),
            }
        }

        let Some(handle) = self.handle.as_mut() else {
            return Err(RelayError::Internal("feed handle missing after open".to_string()));
        };

        match handle.next_batch().await {
            Ok(Some(batch)) => {
                self.failures = 0;
                let Some(checkpoint) = batch.checkpoint() else {
                    return Ok(FeedRead::Empty);
                };
                if batch.events.is_empty() {
                    return Ok(FeedRead::Empty);
                }
                metrics::record_events_read(batch.events.len());
                Ok(FeedRead::Batch {
                    events: batch.events,
                    checkpoint,
                })
            }
            Ok(None) => {
                self.failures = 0;
                info!(checkpoint = ?self.checkpoint, "Change feed ended");
                self.close();
                Ok(FeedRead::EndOfFeed)
            }
            Err(e) => self.on_error(e),
        }
    }

    fn on_error(&mut self, error: FeedError) -> Result<FeedRead> {
        self.close();
        match error {
            FeedError::Invalidated { reason } => {
                warn!(checkpoint = ?self.checkpoint, reason = %reason, "Change feed invalidated");
                Err(RelayError::FeedInvalidated {
                    checkpoint: self.checkpoint.clone(),
                    reason,
                })
            }
            FeedError::Transient(message) => {
                self.failures += 1;
                if !self.retry.allows(self.failures) {
                    warn!(
                        attempts = self.failures,
                        error = %message,
                        "Change feed unavailable, giving up"
                    );
                    return Err(RelayError::FeedUnavailable {
                        attempts: self.failures,
                        message,
                    });
                }
                let delay = self.retry.delay_for_attempt(self.failures);
                warn!(
                    attempt = self.failures,
                    delay_ms = delay.as_millis(),
                    error = %message,
                    "Transient feed error, will reopen"
                );
                metrics::record_feed_reconnect();
                Ok(FeedRead::Reconnecting {
                    attempt: self.failures,
                    delay,
                    reason: message,
                })
            }
        }
    }
}
