// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change events as read from the source feed.

use crate::document::{Document, DocumentKey, Namespace, Value};
use std::fmt;

/// Kind of mutation recorded by the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Delete,
    Update,
    Replace,
    /// Anything else the source emits (drop, rename, invalidate, ...).
    Other(String),
}

impl OperationKind {
    /// Parse the source's operation name. Unknown names become `Other`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "insert" => OperationKind::Insert,
            "delete" => OperationKind::Delete,
            "update" => OperationKind::Update,
            "replace" => OperationKind::Replace,
            _ => OperationKind::Other(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Delete => "delete",
            OperationKind::Update => "update",
            OperationKind::Replace => "replace",
            OperationKind::Other(name) => name,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source-side logical commit time: unix seconds plus an ordinal within that second.
///
/// Ordering is by `seconds`, then `increment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalTime {
    pub seconds: u32,
    pub increment: u32,
}

impl LogicalTime {
    pub fn new(seconds: u32, increment: u32) -> Self {
        Self { seconds, increment }
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seconds, self.increment)
    }
}

/// Opaque, totally ordered feed position.
///
/// Sources must produce tokens whose ordering matches feed order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(data: impl Into<String>) -> Self {
        Self(data.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One mutation read from the source feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// This event's own feed position.
    pub resume_token: ResumeToken,
    pub operation: OperationKind,
    pub cluster_time: LogicalTime,
    pub namespace: Namespace,
    /// `_id` of the affected document.
    pub document_key: Value,
    /// Post-image. Absent for deletes, and for updates whose document was
    /// deleted before the source looked it up.
    pub full_document: Option<Document>,
}

impl ChangeEvent {
    /// Canonical key of the affected document.
    pub fn key(&self) -> DocumentKey {
        DocumentKey::from_value(&self.document_key)
    }
}
