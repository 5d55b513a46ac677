// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable checkpoint persistence.
//!
//! Stores the last committed resume token for each relay in SQLite so a
//! restarted relay resumes after it instead of at the configured start point.
//!
//! ## Checkpoint Semantics
//!
//! The stored token is the checkpoint of the last **fully processed** batch.
//! On restart the feed is reopened strictly after it.
//!
//! ```text
//! drain batch → advance checkpoint → save token
//!               (crash here = batch replayed, idempotent)
//! ```
//!
//! Writes are write-through: one upsert per batch. A failed save is reported
//! to the caller, which logs it and keeps relaying with the in-memory
//! checkpoint.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Every statement is retried with exponential backoff, up to
//! five attempts.

use crate::error::{RelayError, Result};
use crate::event::ResumeToken;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::checkpoint_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Persistent checkpoint storage backed by SQLite.
pub struct CheckpointStore {
    pool: SqlitePool,
    /// Mirror of the table, keyed by relay id.
    cache: RwLock<HashMap<String, ResumeToken>>,
    path: String,
}

impl CheckpointStore {
    /// Open (or create) the checkpoint database at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing checkpoint store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| RelayError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                relay_id TEXT PRIMARY KEY,
                resume_token TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT relay_id, resume_token FROM checkpoints")
            .fetch_all(&pool)
            .await?;

        let cache: HashMap<String, ResumeToken> = rows
            .into_iter()
            .map(|(relay_id, token)| (relay_id, ResumeToken::new(token)))
            .collect();

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: RwLock::new(cache),
            path: path_str,
        })
    }

    /// Stored checkpoint for `relay_id`, if any.
    pub async fn load(&self, relay_id: &str) -> Option<ResumeToken> {
        self.cache.read().await.get(relay_id).cloned()
    }

    /// Persist `token` as the checkpoint for `relay_id`.
    pub async fn save(&self, relay_id: &str, token: &ResumeToken) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        let relay = relay_id.to_string();
        let value = token.as_str().to_string();

        execute_with_retry("checkpoint_save", || async {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (relay_id, resume_token, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(relay_id) DO UPDATE SET
                    resume_token = excluded.resume_token,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&relay)
            .bind(&value)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        self.cache.write().await.insert(relay, token.clone());
        debug!(relay_id = %relay_id, token = %token, "Checkpoint saved");
        Ok(())
    }

    /// Forget the checkpoint for `relay_id` (operator reset after invalidation).
    pub async fn delete(&self, relay_id: &str) -> Result<()> {
        self.cache.write().await.remove(relay_id);

        let pool = &self.pool;
        let relay = relay_id.to_string();
        execute_with_retry("checkpoint_delete", || async {
            sqlx::query("DELETE FROM checkpoints WHERE relay_id = ?")
                .bind(&relay)
                .execute(pool)
                .await
        })
        .await?;

        info!(relay_id = %relay_id, "Deleted checkpoint");
        Ok(())
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        let pool = &self.pool;
        let result = execute_with_retry("checkpoint_wal", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}
