//! Fuzz target for canonical key encoding and translation.
//!
//! Keys built from arbitrary strings, bytes and numbers must be valid JSON,
//! and translating an event with an arbitrary operation name must never panic.

#![no_main]

use changefeed_relay::{
    translate, ChangeEvent, Document, DocumentKey, LogicalTime, Namespace, OperationKind, ResumeToken,
    Value,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &[u8], f64, i64, &str)| {
    let (text, bytes, double, int, operation) = data;

    let compound = Value::Document(
        Document::new()
            .with(text, Value::Bytes(bytes.to_vec()))
            .with("n", double)
            .with("i", int),
    );
    for value in [
        Value::String(text.to_string()),
        Value::Bytes(bytes.to_vec()),
        Value::Double(double),
        compound.clone(),
        Value::Array(vec![compound.clone(), Value::Null]),
    ] {
        let key = DocumentKey::from_value(&value);
        assert!(serde_json::from_str::<serde_json::Value>(key.as_str()).is_ok());
    }

    let event = ChangeEvent {
        resume_token: ResumeToken::new("00"),
        operation: OperationKind::parse(operation),
        cluster_time: LogicalTime::new(0, 0),
        namespace: Namespace::new("db", "c"),
        document_key: Value::Int(int),
        full_document: Some(Document::new().with("_id", int)),
    };
    let _ = translate(&event);
});
