// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Target store integration traits.
//!
//! Defines what the relay needs from the document store it writes into:
//! a long-lived session that can open one transaction at a time and run the
//! three mutation primitives inside it.
//!
//! # Example
//!
//! ```rust,no_run
//! use changefeed_relay::document::{Document, DocumentKey, Namespace};
//! use changefeed_relay::target::{TargetFuture, TargetSession, TargetStore};
//!
//! struct MyStore;
//! struct MySession;
//!
//! impl TargetStore for MyStore {
//!     type Session = MySession;
//!
//!     fn start_session(&self) -> TargetFuture<'_, MySession> {
//!         Box::pin(async { Ok(MySession) })
//!     }
//! }
//!
//! impl TargetSession for MySession {
//!     fn begin_transaction(&mut self) -> TargetFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn insert_one<'a>(&'a mut self, _ns: &'a Namespace, _doc: Document) -> TargetFuture<'a, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn delete_by_key<'a>(&'a mut self, _ns: &'a Namespace, _key: &'a DocumentKey) -> TargetFuture<'a, bool> {
//!         Box::pin(async { Ok(true) })
//!     }
//!
//!     fn upsert_by_key<'a>(
//!         &'a mut self,
//!         _ns: &'a Namespace,
//!         _key: &'a DocumentKey,
//!         _doc: Document,
//!     ) -> TargetFuture<'a, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn commit_transaction(&mut self) -> TargetFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn abort_transaction(&mut self) -> TargetFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//! ```

use crate::document::{Document, DocumentKey, Namespace};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type for target store operations.
pub type TargetResult<T> = std::result::Result<T, TargetError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type TargetFuture<'a, T> = Pin<Box<dyn Future<Output = TargetResult<T>> + Send + 'a>>;

/// Failures reported by the target store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetError {
    /// Uniqueness violation: a document with this key already exists.
    ///
    /// Under at-least-once delivery this means the insert was already applied.
    #[error("duplicate key {key} in {namespace}")]
    DuplicateKey { namespace: Namespace, key: DocumentKey },

    /// Transient store condition (write conflict, election, overload).
    #[error("transient target error: {0}")]
    Transient(String),

    /// The session or its connection is unusable and must be replaced.
    #[error("target connection error: {0}")]
    Connection(String),

    /// The store refused the operation (validation, permissions, bad document).
    #[error("target rejected operation: {0}")]
    Rejected(String),
}

impl TargetError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, TargetError::DuplicateKey { .. })
    }

    /// Whether the session should be discarded after this error.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, TargetError::Connection(_))
    }
}

/// Trait defining what we need from the target document store.
///
/// The store hands out sessions; the relay keeps one session for its lifetime
/// and replaces it only after a [`TargetError::Connection`].
pub trait TargetStore: Send + Sync + 'static {
    type Session: TargetSession;

    /// Open a new session.
    fn start_session(&self) -> TargetFuture<'_, Self::Session>;
}

/// One target session. At most one transaction is open at a time.
pub trait TargetSession: Send + 'static {
    /// Begin a transaction scoped to this session.
    fn begin_transaction(&mut self) -> TargetFuture<'_, ()>;

    /// Insert a new document. Fails with [`TargetError::DuplicateKey`] when
    /// the `_id` already exists.
    fn insert_one<'a>(&'a mut self, namespace: &'a Namespace, document: Document) -> TargetFuture<'a, ()>;

    /// Delete by key. Returns whether a document was removed; absence is not an error.
    fn delete_by_key<'a>(
        &'a mut self,
        namespace: &'a Namespace,
        key: &'a DocumentKey,
    ) -> TargetFuture<'a, bool>;

    /// Replace the document stored under `key`, inserting it when absent.
    fn upsert_by_key<'a>(
        &'a mut self,
        namespace: &'a Namespace,
        key: &'a DocumentKey,
        document: Document,
    ) -> TargetFuture<'a, ()>;

    /// Commit the open transaction.
    fn commit_transaction(&mut self) -> TargetFuture<'_, ()>;

    /// Abort the open transaction. Aborting with no open transaction is a no-op.
    fn abort_transaction(&mut self) -> TargetFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Value;

    #[test]
    fn test_duplicate_key_classification() {
        let err = TargetError::DuplicateKey {
            namespace: Namespace::new("db", "c"),
            key: DocumentKey::from_value(&Value::Int(1)),
        };
        assert!(err.is_duplicate_key());
        assert!(!err.is_session_lost());
        assert_eq!(err.to_string(), "duplicate key 1 in db.c");
    }

    #[test]
    fn test_transient_classification() {
        let err = TargetError::Transient("write conflict".to_string());
        assert!(!err.is_duplicate_key());
        assert!(!err.is_session_lost());
    }

    #[test]
    fn test_connection_loses_session() {
        let err = TargetError::Connection("socket closed".to_string());
        assert!(!err.is_duplicate_key());
        assert!(err.is_session_lost());
    }

    #[test]
    fn test_rejected_keeps_session() {
        let err = TargetError::Rejected("document too large".to_string());
        assert!(!err.is_session_lost());
        assert!(err.to_string().contains("document too large"));
    }
}
