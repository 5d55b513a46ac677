//! Fuzz target for lag calculation.
//!
//! This tests that `delay_seconds` never panics and matches the
//! clock-minus-commit formula on arbitrary input.

#![no_main]

use changefeed_relay::lag::delay_seconds;
use changefeed_relay::LogicalTime;
use libfuzzer_sys::fuzz_target;
use std::time::{Duration, UNIX_EPOCH};

fuzz_target!(|data: (u32, u32, u32)| {
    let (seconds, increment, now_secs) = data;
    let now = UNIX_EPOCH + Duration::from_secs(u64::from(now_secs));

    let lag = delay_seconds(LogicalTime::new(seconds, increment), now);
    assert_eq!(lag, i64::from(now_secs) - i64::from(seconds));
});
