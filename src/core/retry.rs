//! Retry scheduling policies.
//!
//! A [`RetryScheduler`] maps a failed job's retry history to the delay before
//! the next attempt becomes eligible. Implementations are pure functions of
//! the prior retry count; persisting the resulting eligible instant is the
//! lifecycle's responsibility.

use std::time::Duration;

/// Capability interface for computing retry delays.
///
/// `prior_retries` is the number of retry jobs already recorded in the chain
/// before the failure being scheduled (0 for the first failure of a root job).
pub trait RetryScheduler: Send + Sync {
    /// Delay before the next attempt may be dispatched.
    fn schedule_next_retry(&self, prior_retries: u32) -> Duration;
}

/// Exponential backoff: `base ^ (prior_retries + 1)` seconds.
///
/// The exponent counts the retry being scheduled, so the first retry of a job
/// with base 5 waits 5 seconds and the third waits 125. Large attempt counts
/// saturate at `max_delay` instead of overflowing.
#[derive(Debug, Clone)]
pub struct ExponentialRetryScheduler {
    base: u32,
    max_delay: Duration,
}

impl ExponentialRetryScheduler {
    /// Default ceiling for a single retry delay: one day.
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(86_400);

    /// Create a scheduler with the given base (must be positive).
    pub fn new(base: u32) -> Self {
        assert!(base > 0, "backoff base must be positive");
        Self {
            base,
            max_delay: Self::DEFAULT_MAX_DELAY,
        }
    }

    /// Replace the saturation ceiling.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}

impl Default for ExponentialRetryScheduler {
    fn default() -> Self {
        Self::new(5)
    }
}

impl RetryScheduler for ExponentialRetryScheduler {
    fn schedule_next_retry(&self, prior_retries: u32) -> Duration {
        let exponent = prior_retries.saturating_add(1);
        match u64::from(self.base).checked_pow(exponent) {
            Some(secs) => Duration::from_secs(secs).min(self.max_delay),
            None => self.max_delay,
        }
    }
}

/// Constant backoff: every retry waits the same fixed delay.
#[derive(Debug, Clone)]
pub struct FixedRetryScheduler {
    delay: Duration,
}

impl FixedRetryScheduler {
    /// Create a scheduler with a fixed delay between attempts.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RetryScheduler for FixedRetryScheduler {
    fn schedule_next_retry(&self, _prior_retries: u32) -> Duration {
        self.delay
    }
}
