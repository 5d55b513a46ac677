//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Feed reads and reconnects
//! - Per-event apply outcomes and latency
//! - Batch processing stats
//! - Replication lag and the lag SLO
//! - Checkpoint persistence
//! - Engine state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `relay_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use changefeed_relay::metrics;
//! use std::time::Duration;
//!
//! // After a batch is drained
//! metrics::record_batch("orders-relay", 100, 90, 5, 3, 2, Duration::from_millis(50));
//! ```

use crate::document::Namespace;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record events pulled from the change feed.
pub fn record_events_read(count: usize) {
    counter!("relay_events_read_total").increment(count as u64);
}

/// Record one apply attempt with its outcome (`success`, `conflict`, `failure`).
pub fn record_apply(namespace: &Namespace, op: &str, outcome: &str, duration: Duration) {
    counter!(
        "relay_apply_total",
        "namespace" => namespace.to_string(),
        "op" => op.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("relay_apply_duration_seconds", "op" => op.to_string()).record(duration.as_secs_f64());
}

/// Record an event that produced no mutation.
pub fn record_event_skipped(reason: &str) {
    counter!("relay_events_skipped_total", "reason" => reason.to_string()).increment(1);
}

/// Record a drained batch.
pub fn record_batch(
    relay_id: &str,
    total: usize,
    applied: usize,
    conflicts: usize,
    skipped: usize,
    failed: usize,
    duration: Duration,
) {
    let relay = relay_id.to_string();

    counter!("relay_batches_total", "relay_id" => relay.clone()).increment(1);
    counter!("relay_batch_events_total", "relay_id" => relay.clone()).increment(total as u64);
    counter!("relay_batch_applied_total", "relay_id" => relay.clone()).increment(applied as u64);
    counter!("relay_batch_conflicts_total", "relay_id" => relay.clone()).increment(conflicts as u64);
    counter!("relay_batch_skipped_total", "relay_id" => relay.clone()).increment(skipped as u64);

    if failed > 0 {
        counter!("relay_batch_failed_total", "relay_id" => relay.clone()).increment(failed as u64);
    }

    histogram!("relay_batch_duration_seconds", "relay_id" => relay.clone()).record(duration.as_secs_f64());
    histogram!("relay_batch_size", "relay_id" => relay).record(total as f64);
}

/// Record a poll that returned no events.
pub fn record_empty_poll(relay_id: &str) {
    counter!("relay_empty_polls_total", "relay_id" => relay_id.to_string()).increment(1);
}

/// Record replication lag at a batch head. May be negative under clock skew.
pub fn record_replication_lag(relay_id: &str, lag_seconds: i64) {
    gauge!("relay_replication_lag_seconds", "relay_id" => relay_id.to_string()).set(lag_seconds as f64);
}

/// Set the lag SLO gauges.
pub fn set_replication_lag_slo(relay_id: &str, lag_seconds: i64, threshold_seconds: u64) {
    gauge!("relay_lag_slo_seconds", "relay_id" => relay_id.to_string()).set(lag_seconds as f64);

    let is_violation = if lag_seconds > 0 && lag_seconds as u64 > threshold_seconds {
        1.0
    } else {
        0.0
    };
    gauge!("relay_lag_slo_violation", "relay_id" => relay_id.to_string()).set(is_violation);
}

/// Record a lag SLO violation.
pub fn record_slo_violation(relay_id: &str, lag_seconds: i64) {
    counter!("relay_slo_violations_total", "relay_id" => relay_id.to_string()).increment(1);
    histogram!("relay_slo_violation_lag_seconds", "relay_id" => relay_id.to_string()).record(lag_seconds as f64);
}

/// Record a feed reopen after a transient error.
pub fn record_feed_reconnect() {
    counter!("relay_feed_reconnects_total").increment(1);
}

/// Record checkpoint persistence.
pub fn record_checkpoint_persist(relay_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_checkpoint_persists_total", "relay_id" => relay_id.to_string(), "status" => status).increment(1);
}

/// Record checkpoint SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn checkpoint_retries_total(operation: &str) {
    counter!("relay_checkpoint_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a fatal error by type.
pub fn record_error(relay_id: &str, error_type: &str) {
    counter!("relay_errors_total", "relay_id" => relay_id.to_string(), "error_type" => error_type.to_string()).increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Idle" => 0.0,
        "FeedOpen" => 1.0,
        "Draining" => 2.0,
        "Stopped" => 3.0,
        "Failed" => 4.0,
        _ => -1.0,
    };
    gauge!("relay_engine_state").set(value);
}
