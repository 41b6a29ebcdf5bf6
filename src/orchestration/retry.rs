//! Retry policy.
//!
//! `decide` looks only at a failure classification and the number of
//! attempts already made. Delays grow exponentially from the base delay,
//! are capped at the max delay, and use equal jitter: the actual wait is
//! drawn uniformly from the upper half of the capped delay.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::orchestration::FailureClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-attempt once the duration has passed.
    Wait(Duration),
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Ceiling on the total number of attempts for one task.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn has_attempts_left(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Capped exponential delay after `attempts_made` attempts (1-based).
    pub fn backoff(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Inclusive range the jittered wait is drawn from.
    pub fn delay_bounds(&self, attempts_made: u32) -> (Duration, Duration) {
        let upper = self.backoff(attempts_made);
        (upper / 2, upper)
    }

    pub fn decide(&self, class: FailureClass, attempts_made: u32) -> RetryDecision {
        self.decide_with(class, attempts_made, &mut rand::thread_rng())
    }

    /// Same as [`decide`](Self::decide) with a caller-supplied RNG.
    pub fn decide_with<R: Rng>(
        &self,
        class: FailureClass,
        attempts_made: u32,
        rng: &mut R,
    ) -> RetryDecision {
        if !class.is_retryable() || !self.has_attempts_left(attempts_made) {
            return RetryDecision::GiveUp;
        }
        let (low, high) = self.delay_bounds(attempts_made);
        let low_ms = low.as_millis() as u64;
        let high_ms = high.as_millis() as u64;
        let wait = if high_ms > low_ms {
            rng.gen_range(low_ms..=high_ms)
        } else {
            high_ms
        };
        RetryDecision::Wait(Duration::from_millis(wait))
    }
}
