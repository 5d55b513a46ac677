// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Schema-less document payloads and store-agnostic keys.
//!
//! A [`Document`] is an ordered list of `(field, Value)` pairs. Field order is
//! preserved exactly as received so a post-image round-trips unchanged to the
//! target.
//!
//! # Key Encoding
//!
//! Target lookups never compare native identifiers. Every `_id` is reduced to a
//! [`DocumentKey`]: a canonical JSON rendering of the value that keeps its type.
//!
//! ```text
//! Value                      DocumentKey
//! ─────────────────────────  ─────────────────────────
//! String("1")                "1"
//! Int(1)                     1
//! Double(1.5)                1.5
//! Double(NaN)                {"$double":"NaN"}
//! Bytes([0xab, 0x01])        {"$binary":"ab01"}
//! Document{a: 1, b: "x"}     {"a":1,"b":"x"}
//! Document{$binary: "ab"}    {"$document":{"$binary":"ab"}}
//! ```
//!
//! The encoding is injective across types, so the string `"1"` and the integer
//! `1` never address the same target document.

use std::fmt;
use std::fmt::Write as _;

/// Name of the identifier field inside a document.
pub const ID_FIELD: &str = "_id";

/// Dynamically-typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Document(Document),
    Array(Vec<Value>),
}

impl Value {
    /// Short type name, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Document(_) => "document",
            Value::Array(_) => "array",
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Append the canonical encoding of this value to `out`.
    fn write_canonical(&self, out: &mut String) {
        match self {
            Value::Null => out.push_str("null"),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Int(i) => {
                let _ = write!(out, "{}", i);
            }
            Value::Double(d) => write_double(*d, out),
            Value::String(s) => write_json_string(s, out),
            Value::Bytes(bytes) => {
                out.push_str("{\"$binary\":\"");
                for b in bytes {
                    let _ = write!(out, "{:02x}", b);
                }
                out.push_str("\"}");
            }
            Value::Document(doc) => {
                // A `$`-led document could otherwise spell one of the type tags
                if doc.fields.first().is_some_and(|(name, _)| name.starts_with('$')) {
                    out.push_str("{\"$document\":");
                    doc.write_canonical(out);
                    out.push('}');
                } else {
                    doc.write_canonical(out);
                }
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.write_canonical(out);
                }
                out.push(']');
            }
        }
    }

    /// Canonical, type-preserving text form of this value.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }
}

fn write_double(d: f64, out: &mut String) {
    // Tagged so they cannot collide with the strings "NaN" / "Infinity"
    if d.is_nan() {
        out.push_str(r#"{"$double":"NaN"}"#);
    } else if d.is_infinite() {
        out.push_str(if d > 0.0 {
            r#"{"$double":"Infinity"}"#
        } else {
            r#"{"$double":"-Infinity"}"#
        });
    } else {
        // serde_json keeps a fractional part ("1.0"), so doubles never collide with ints
        match serde_json::Number::from_f64(d) {
            Some(n) => {
                let _ = write!(out, "{}", n);
            }
            None => out.push_str("null"),
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Document> for Value {
    fn from(d: Document) -> Self {
        Value::Document(d)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

/// Ordered mapping of field name to [`Value`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    /// Set a field. An existing field keeps its position; a new one is appended.
    ///
    /// Returns the previous value, if any.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let field = field.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| *name == field) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.fields.push((field, value));
                None
            }
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(name, _)| name == field)?;
        Some(self.fields.remove(idx).1)
    }

    /// The `_id` value, if present.
    pub fn id(&self) -> Option<&Value> {
        self.get(ID_FIELD)
    }

    /// The canonical key of this document's `_id`.
    pub fn key(&self) -> Option<DocumentKey> {
        self.id().map(DocumentKey::from_value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    fn write_canonical(&self, out: &mut String) {
        out.push('{');
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_json_string(name, out);
            out.push(':');
            value.write_canonical(out);
        }
        out.push('}');
    }

    /// Canonical JSON rendering (for diagnostics).
    pub fn to_canonical_json(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (field, value) in iter {
            doc.insert(field, value);
        }
        doc
    }
}

/// Canonical, store-agnostic identifier of a target document.
///
/// Built from the `_id` value with [`DocumentKey::from_value`]. Two keys are
/// equal exactly when the underlying values are equal in type and content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey(String);

impl DocumentKey {
    pub fn from_value(value: &Value) -> Self {
        Self(value.canonical())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Value> for DocumentKey {
    fn from(value: &Value) -> Self {
        Self::from_value(value)
    }
}

/// Database + collection pair identifying a target collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}
