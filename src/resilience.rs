//! Retry policy: exponential backoff for transient feed failures.
//!
//! The feed reader uses [`RetryConfig`] to space reopen attempts after a
//! transient read error. Per-event target failures are never retried.
//!
//! # Example
//!
//! ```rust
//! use changefeed_relay::resilience::RetryConfig;
//! use std::time::Duration;
//!
//! let retry = RetryConfig::testing();
//! assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(10));
//! assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(20));
//! ```

use std::time::Duration;

/// Backoff schedule for feed reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Consecutive failed attempts tolerated before giving up.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,

    /// Multiplier applied per attempt (2.0 = double each time).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn allows(&self, failures: usize) -> bool {
        failures < self.max_attempts
    }
}
