//! Pure exponential-backoff retry policy: no I/O, no randomness.
//!
//! Callers that need jitter wrap this policy rather than the policy
//! growing a jitter knob of its own.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay_seconds: i64,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_seconds: 60,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay_seconds: i64, max_attempts: u32) -> Self {
        Self {
            base_delay_seconds,
            max_attempts,
        }
    }

    /// `base_delay * 2^(attempts - 1)`. `attempts` is 1-based, counting
    /// the failure that just happened.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let seconds = self.base_delay_seconds.saturating_mul(1i64 << exponent.min(32));
        Duration::seconds(seconds)
    }

    pub fn next_run(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        now + self.delay(attempts)
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
