//! Backoff policies for transient failures
//!
//! When a delivery attempt fails without the platform telling us how long to
//! wait (network error, call timeout), the next attempt is pushed out by a
//! [`BackoffPolicy`].
//!
//! # Example
//!
//! ```rust
//! use herald_extras::retry::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::exponential(Duration::from_secs(2), Duration::from_secs(60));
//!
//! assert_eq!(policy.delay_for(0), Duration::from_secs(2));
//! assert_eq!(policy.delay_for(3), Duration::from_secs(16));
//! assert_eq!(policy.delay_for(10), Duration::from_secs(60));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Growth curve of the delay as retries accumulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Same delay every time.
    Fixed,
    /// `base * retry` for the n-th retry, counting from one.
    Linear,
    /// `base * 2^retry`, counting from zero.
    #[default]
    Exponential,
}

/// Delay schedule for retries of transient failures.
///
/// Every delay is clamped to `ceiling`, including the ones that would
/// overflow a [`Duration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    strategy: RetryStrategy,
    base: Duration,
    ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(2), Duration::from_secs(3600))
    }
}

impl BackoffPolicy {
    /// Policy with an explicit strategy. A `ceiling` below `base` is raised
    /// to `base`.
    pub fn new(strategy: RetryStrategy, base: Duration, ceiling: Duration) -> Self {
        Self {
            strategy,
            base,
            ceiling: ceiling.max(base),
        }
    }

    /// Always wait `delay`.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(RetryStrategy::Fixed, delay, delay)
    }

    /// Grow by `step` per retry up to `ceiling`.
    pub fn linear(step: Duration, ceiling: Duration) -> Self {
        Self::new(RetryStrategy::Linear, step, ceiling)
    }

    /// Double from `base` per retry up to `ceiling`.
    pub fn exponential(base: Duration, ceiling: Duration) -> Self {
        Self::new(RetryStrategy::Exponential, base, ceiling)
    }

    /// Growth curve in use.
    pub fn strategy(&self) -> RetryStrategy {
        self.strategy
    }

    /// Largest delay this policy hands out.
    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Delay before retry number `retry` (zero-based: 0 is the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = match self.strategy {
            RetryStrategy::Fixed => Some(1),
            RetryStrategy::Linear => retry.checked_add(1),
            RetryStrategy::Exponential => 2_u32.checked_pow(retry),
        };

        factor
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.ceiling, |delay| delay.min(self.ceiling))
    }
}
