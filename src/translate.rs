// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change event → target mutation.
//!
//! ```text
//! Insert            ──▶ Insert(full_document)
//! Delete            ──▶ DeleteByKey(key(document_key))
//! Update | Replace  ──▶ UpsertByKey(key(full_document._id), full_document)
//! anything else     ──▶ Skip(UnknownOperation)
//! ```
//!
//! Updates are replayed as whole-document replaces: the feed carries the
//! post-image, not the source's update operators, so a patch cannot be
//! reconstructed. Replace-by-key is also what makes replays converge.

use crate::document::{Document, DocumentKey};
use crate::event::{ChangeEvent, OperationKind};
use std::fmt;

/// Why an event produced no mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The source emitted an operation kind the relay does not replicate.
    UnknownOperation(String),
    /// An insert/update/replace arrived without a post-image.
    MissingPostImage(OperationKind),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnknownOperation(op) => write!(f, "unknown operation kind: {}", op),
            SkipReason::MissingPostImage(op) => write!(f, "{} without post-image", op),
        }
    }
}

/// Mutation kind, for metrics labels and failure context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Insert,
    Delete,
    Upsert,
    Skip,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Insert => "insert",
            MutationKind::Delete => "delete",
            MutationKind::Upsert => "upsert",
            MutationKind::Skip => "skip",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One write to perform against the target.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetMutation {
    Insert { document: Document },
    DeleteByKey { key: DocumentKey },
    UpsertByKey { key: DocumentKey, document: Document },
    Skip { reason: SkipReason },
}

impl TargetMutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            TargetMutation::Insert { .. } => MutationKind::Insert,
            TargetMutation::DeleteByKey { .. } => MutationKind::Delete,
            TargetMutation::UpsertByKey { .. } => MutationKind::Upsert,
            TargetMutation::Skip { .. } => MutationKind::Skip,
        }
    }

    /// Key addressed by this mutation, when it addresses one.
    pub fn key(&self) -> Option<DocumentKey> {
        match self {
            TargetMutation::Insert { document } => document.key(),
            TargetMutation::DeleteByKey { key } => Some(key.clone()),
            TargetMutation::UpsertByKey { key, .. } => Some(key.clone()),
            TargetMutation::Skip { .. } => None,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, TargetMutation::Skip { .. })
    }
}

/// Translate one change event. Total and side-effect free.
pub fn translate(event: &ChangeEvent) -> TargetMutation {
    match &event.operation {
        OperationKind::Insert => match &event.full_document {
            Some(document) => TargetMutation::Insert {
                document: document.clone(),
            },
            None => TargetMutation::Skip {
                reason: SkipReason::MissingPostImage(OperationKind::Insert),
            },
        },
        OperationKind::Delete => TargetMutation::DeleteByKey { key: event.key() },
        op @ (OperationKind::Update | OperationKind::Replace) => match &event.full_document {
            Some(document) => {
                // Post-image `_id` wins; the event key is the fallback
                let key = document.key().unwrap_or_else(|| event.key());
                TargetMutation::UpsertByKey {
                    key,
                    document: document.clone(),
                }
            }
            None => TargetMutation::Skip {
                reason: SkipReason::MissingPostImage(op.clone()),
            },
        },
        OperationKind::Other(name) => TargetMutation::Skip {
            reason: SkipReason::UnknownOperation(name.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Namespace, Value};
    use crate::event::{LogicalTime, ResumeToken};

    fn event(op: OperationKind, id: Value, doc: Option<Document>) -> ChangeEvent {
        ChangeEvent {
            resume_token: ResumeToken::new("0000000000000001"),
            operation: op,
            cluster_time: LogicalTime::new(1_700_000_000, 1),
            namespace: Namespace::new("shop", "orders"),
            document_key: id,
            full_document: doc,
        }
    }

    #[test]
    fn test_insert_carries_full_document() {
        let doc = Document::new().with("_id", 1).with("a", 1);
        let m = translate(&event(OperationKind::Insert, Value::Int(1), Some(doc.clone())));
        assert_eq!(m, TargetMutation::Insert { document: doc });
        assert_eq!(m.kind(), MutationKind::Insert);
        assert_eq!(m.key().unwrap().as_str(), "1");
    }

    #[test]
    fn test_delete_uses_document_key() {
        let m = translate(&event(OperationKind::Delete, Value::from("k1"), None));
        match m {
            TargetMutation::DeleteByKey { key } => assert_eq!(key.as_str(), "\"k1\""),
            other => panic!("expected DeleteByKey, got {:?}", other),
        }
    }

    #[test]
    fn test_update_becomes_upsert_by_key() {
        let doc = Document::new().with("_id", 2).with("b", 5);
        let m = translate(&event(OperationKind::Update, Value::Int(2), Some(doc.clone())));
        assert_eq!(
            m,
            TargetMutation::UpsertByKey {
                key: DocumentKey::from_value(&Value::Int(2)),
                document: doc,
            }
        );
    }

    #[test]
    fn test_replace_becomes_upsert_by_key() {
        let doc = Document::new().with("_id", "x").with("v", 1);
        let m = translate(&event(OperationKind::Replace, Value::from("x"), Some(doc)));
        assert_eq!(m.kind(), MutationKind::Upsert);
    }

    #[test]
    fn test_update_without_id_falls_back_to_event_key() {
        let doc = Document::new().with("b", 5);
        let m = translate(&event(OperationKind::Update, Value::Int(9), Some(doc)));
        assert_eq!(m.key().unwrap().as_str(), "9");
    }

    #[test]
    fn test_update_without_post_image_is_skipped() {
        let m = translate(&event(OperationKind::Update, Value::Int(3), None));
        assert_eq!(
            m,
            TargetMutation::Skip {
                reason: SkipReason::MissingPostImage(OperationKind::Update)
            }
        );
        assert!(m.key().is_none());
    }

    #[test]
    fn test_insert_without_post_image_is_skipped() {
        let m = translate(&event(OperationKind::Insert, Value::Int(3), None));
        assert!(m.is_skip());
    }

    #[test]
    fn test_unknown_operation_is_skipped() {
        let m = translate(&event(
            OperationKind::Other("drop".to_string()),
            Value::Null,
            None,
        ));
        assert_eq!(
            m,
            TargetMutation::Skip {
                reason: SkipReason::UnknownOperation("drop".to_string())
            }
        );
    }

    #[test]
    fn test_translate_is_deterministic() {
        let doc = Document::new().with("_id", 7).with("n", 1);
        let e = event(OperationKind::Replace, Value::Int(7), Some(doc));
        assert_eq!(translate(&e), translate(&e));
    }

    #[test]
    fn test_skip_reason_display() {
        assert_eq!(
            SkipReason::UnknownOperation("rename".into()).to_string(),
            "unknown operation kind: rename"
        );
        assert_eq!(
            SkipReason::MissingPostImage(OperationKind::Update).to_string(),
            "update without post-image"
        );
    }
}
