//! Retry backoff policy.
//!
//! Exponential backoff with full jitter: each delay is drawn uniformly from
//! `[0, min(max_delay, base_delay * 2^attempt)]`. Which errors are eligible
//! for retry at all is decided by [`crate::Error::is_retriable`]; this module
//! only computes how long to wait.

use std::time::Duration;

use rand::Rng as _;

/// Backoff configuration for retriable failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` disables retries.
    pub max_attempts: u32,
    /// Backoff base; doubled per attempt before jitter.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to sleep after the given failed attempt (1-based).
    ///
    /// Full jitter: uniform in `[0, cap]` where
    /// `cap = min(max_delay, base_delay * 2^(attempt - 1))`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let cap = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        let cap_millis = cap.as_millis() as u64;
        if cap_millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=cap_millis))
    }
}
