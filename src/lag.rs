// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication delay: wall clock minus the source's logical commit time.
//!
//! Observability only. Nothing in the relay branches on lag except the SLO
//! warning diagnostic.

use crate::event::{ChangeEvent, LogicalTime};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between `commit` and `now`.
///
/// Negative when the source clock runs ahead of ours.
pub fn delay_seconds(commit: LogicalTime, now: SystemTime) -> i64 {
    unix_seconds(now).saturating_sub(i64::from(commit.seconds))
}

/// Delay of `event` against the current wall clock.
pub fn event_delay_seconds(event: &ChangeEvent) -> i64 {
    delay_seconds(event.cluster_time, SystemTime::now())
}

/// Unix seconds for `t`, negative before the epoch. Saturates at the `i64` bounds.
pub fn unix_seconds(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        Err(e) => i64::try_from(e.duration().as_secs()).map_or(i64::MIN, |secs| -secs),
    }
}
