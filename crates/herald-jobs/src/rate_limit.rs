//! Token-bucket rate limiting.
//!
//! Each destination gets its own bucket, and every send also draws from one
//! global bucket shared by the whole process. When the platform answers with
//! an explicit "retry after", [`RateLimiter::report_external_wait`] empties
//! the bucket and blocks it until the wait has elapsed.
//!
//! # Example
//!
//! ```ignore
//! use herald_jobs::rate_limit::{BucketConfig, Permit, RateLimiter};
//!
//! let limiter = RateLimiter::new(
//!     BucketConfig::new(1, 1.0),   // one message per second per chat
//!     BucketConfig::new(30, 30.0), // thirty per second overall
//!     Arc::new(SystemClock),
//! );
//!
//! match limiter.acquire(&destination) {
//!     Permit::Granted => send().await,
//!     Permit::Denied { resume_at } => reschedule(resume_at),
//! }
//! ```

use crate::clock::Clock;
use crate::job::{add_std, Destination};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Capacity and refill rate of a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    pub burst: u32,
    pub refill_per_sec: f64,
}

impl BucketConfig {
    pub fn new(burst: u32, refill_per_sec: f64) -> Self {
        Self {
            burst,
            refill_per_sec,
        }
    }
}

/// Result of asking the limiter for a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Granted,
    /// No token available; try again no earlier than `resume_at`.
    Denied { resume_at: DateTime<Utc> },
}

impl Permit {
    pub fn is_granted(&self) -> bool {
        matches!(self, Permit::Granted)
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    refilled_at: DateTime<Utc>,
    blocked_until: Option<DateTime<Utc>>,
}

impl TokenBucket {
    fn full(config: &BucketConfig, now: DateTime<Utc>) -> Self {
        Self {
            tokens: f64::from(config.burst),
            refilled_at: now,
            blocked_until: None,
        }
    }

    fn refill(&mut self, config: &BucketConfig, now: DateTime<Utc>) {
        if let Some(until) = self.blocked_until {
            if now < until {
                return;
            }
            // The platform said we may resume at `until`.
            self.blocked_until = None;
            self.refilled_at = self.refilled_at.max(until);
            self.tokens = self.tokens.max(1.0);
        }

        let elapsed = (now - self.refilled_at).num_milliseconds();
        if elapsed > 0 {
            let gained = elapsed as f64 / 1000.0 * config.refill_per_sec;
            self.tokens = (self.tokens + gained).min(f64::from(config.burst));
            self.refilled_at = now;
        }
    }

    fn take(&mut self, config: &BucketConfig, now: DateTime<Utc>) -> Permit {
        self.refill(config, now);

        if let Some(until) = self.blocked_until {
            return Permit::Denied { resume_at: until };
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Permit::Granted;
        }

        let missing = 1.0 - self.tokens;
        let wait_ms = (missing / config.refill_per_sec * 1000.0).ceil();
        Permit::Denied {
            resume_at: add_std(now, Duration::from_millis(wait_ms as u64)),
        }
    }

    fn give_back(&mut self, config: &BucketConfig) {
        self.tokens = (self.tokens + 1.0).min(f64::from(config.burst));
    }

    fn block(&mut self, now: DateTime<Utc>, wait: Duration) {
        let until = add_std(now, wait);
        self.tokens = 0.0;
        self.refilled_at = now;
        self.blocked_until = Some(match self.blocked_until {
            Some(existing) => existing.max(until),
            None => until,
        });
    }

    fn is_idle(&self, config: &BucketConfig) -> bool {
        self.blocked_until.is_none() && self.tokens >= f64::from(config.burst)
    }
}

/// Per-destination and global token buckets.
pub struct RateLimiter {
    destination: BucketConfig,
    global: BucketConfig,
    buckets: DashMap<Destination, TokenBucket>,
    global_bucket: Mutex<TokenBucket>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(destination: BucketConfig, global: BucketConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            destination,
            global,
            buckets: DashMap::new(),
            global_bucket: Mutex::new(TokenBucket::full(&global, now)),
            clock,
        }
    }

    fn global_bucket(&self) -> std::sync::MutexGuard<'_, TokenBucket> {
        self.global_bucket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a token from `destination`'s bucket only.
    pub fn try_acquire(&self, destination: &Destination) -> Permit {
        let now = self.clock.now();
        let config = self.destination;
        let mut bucket = self
            .buckets
            .entry(destination.clone())
            .or_insert_with(|| TokenBucket::full(&config, now));
        bucket.take(&config, now)
    }

    /// Take a token from the global bucket only.
    pub fn acquire_global(&self) -> Permit {
        let now = self.clock.now();
        self.global_bucket().take(&self.global, now)
    }

    /// Take one token from both buckets, or from neither.
    pub fn acquire(&self, destination: &Destination) -> Permit {
        let local = self.try_acquire(destination);
        if let Permit::Denied { .. } = local {
            return local;
        }

        let global = self.acquire_global();
        if let Permit::Denied { .. } = global {
            if let Some(mut bucket) = self.buckets.get_mut(destination) {
                bucket.give_back(&self.destination);
            }
        }
        global
    }

    /// The platform asked us to wait before talking to `destination` again.
    pub fn report_external_wait(&self, destination: &Destination, wait: Duration) {
        let now = self.clock.now();
        let config = self.destination;
        self.buckets
            .entry(destination.clone())
            .or_insert_with(|| TokenBucket::full(&config, now))
            .block(now, wait);
        tracing::debug!(destination = %destination, wait_ms = wait.as_millis() as u64, "destination throttled by platform");
    }

    /// The platform asked us to slow down across all destinations.
    pub fn report_global_wait(&self, wait: Duration) {
        let now = self.clock.now();
        self.global_bucket().block(now, wait);
        tracing::debug!(wait_ms = wait.as_millis() as u64, "global throttle reported");
    }

    /// Drop buckets that are full and unblocked. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let now = self.clock.now();
        let config = self.destination;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.refill(&config, now);
            !bucket.is_idle(&config)
        });
        before - self.buckets.len()
    }

    /// Number of destinations currently tracked.
    pub fn tracked_destinations(&self) -> usize {
        self.buckets.len()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("destination", &self.destination)
            .field("global", &self.global)
            .field("tracked_destinations", &self.buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    fn limiter(dest: BucketConfig, global: BucketConfig) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        (RateLimiter::new(dest, global, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn burst_then_denied_until_refill() {
        let (limiter, clock) = limiter(BucketConfig::new(2, 1.0), BucketConfig::new(100, 100.0));
        let chat = Destination::from("chat");

        assert!(limiter.acquire(&chat).is_granted());
        assert!(limiter.acquire(&chat).is_granted());
        let denied = limiter.acquire(&chat);
        assert_eq!(
            denied,
            Permit::Denied {
                resume_at: clock.now() + chrono::Duration::seconds(1)
            }
        );

        clock.advance(Duration::from_secs(1));
        assert!(limiter.acquire(&chat).is_granted());
    }

    #[test]
    fn destinations_are_independent() {
        let (limiter, _) = limiter(BucketConfig::new(1, 1.0), BucketConfig::new(100, 100.0));
        assert!(limiter.acquire(&"a".into()).is_granted());
        assert!(!limiter.acquire(&"a".into()).is_granted());
        assert!(limiter.acquire(&"b".into()).is_granted());
    }

    #[test]
    fn global_denial_refunds_destination_token() {
        let (limiter, clock) = limiter(BucketConfig::new(1, 1.0), BucketConfig::new(1, 1.0));

        assert!(limiter.acquire(&"a".into()).is_granted());
        assert!(!limiter.acquire(&"b".into()).is_granted());

        clock.advance(Duration::from_secs(1));
        // "b" kept its token, so only the global bucket needed to refill.
        assert!(limiter.acquire(&"b".into()).is_granted());
    }

    #[test]
    fn external_wait_blocks_then_recovers() {
        let (limiter, clock) = limiter(BucketConfig::new(5, 1.0), BucketConfig::new(100, 100.0));
        let chat = Destination::from("chat");

        limiter.report_external_wait(&chat, Duration::from_secs(30));
        let start = clock.now();
        assert_eq!(
            limiter.try_acquire(&chat),
            Permit::Denied {
                resume_at: start + chrono::Duration::seconds(30)
            }
        );

        clock.advance(Duration::from_secs(29));
        assert!(!limiter.try_acquire(&chat).is_granted());

        clock.advance(Duration::from_secs(1));
        assert!(limiter.try_acquire(&chat).is_granted());
        assert!(!limiter.try_acquire(&chat).is_granted());
    }

    #[test]
    fn global_wait_blocks_every_destination() {
        let (limiter, clock) = limiter(BucketConfig::new(5, 1.0), BucketConfig::new(100, 100.0));
        limiter.report_global_wait(Duration::from_secs(10));

        assert!(!limiter.acquire(&"a".into()).is_granted());
        assert!(!limiter.acquire(&"b".into()).is_granted());

        clock.advance(Duration::from_secs(11));
        assert!(limiter.acquire(&"a".into()).is_granted());
    }

    #[test]
    fn prune_drops_full_buckets_only() {
        let (limiter, clock) = limiter(BucketConfig::new(1, 1.0), BucketConfig::new(100, 100.0));
        limiter.acquire(&"a".into());
        limiter.report_external_wait(&"b".into(), Duration::from_secs(60));

        clock.advance(Duration::from_secs(2));
        assert_eq!(limiter.prune_idle(), 1);
        assert_eq!(limiter.tracked_destinations(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Over any window, grants never exceed burst + rate * elapsed.
        #[test]
        fn prop_grants_bounded_by_rate(
            burst in 1u32..10,
            rate in 1u32..20,
            steps in prop::collection::vec(0u64..500, 1..200),
        ) {
            let (limiter, clock) = limiter(
                BucketConfig::new(burst, f64::from(rate)),
                BucketConfig::new(10_000, 10_000.0),
            );
            let chat = Destination::from("chat");
            let mut granted = 0u64;
            let mut elapsed_ms = 0u64;

            for step in steps {
                clock.advance(Duration::from_millis(step));
                elapsed_ms += step;
                if limiter.acquire(&chat).is_granted() {
                    granted += 1;
                }
            }

            let allowed = u64::from(burst) + (u64::from(rate) * elapsed_ms) / 1000 + 1;
            prop_assert!(granted <= allowed);
        }
    }
}
