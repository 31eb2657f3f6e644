//! Engine configuration.

use crate::error::{JobError, Result};
use crate::rate_limit::BucketConfig;
use herald_extras::retry::{BackoffPolicy, RetryStrategy};
use serde::Deserialize;
use std::time::Duration;

/// Static configuration bundle read once at startup.
///
/// Field names double as environment variable names (upper-cased, usually
/// with a `HERALD_` prefix), so the struct stays flat.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts per destination when the submitter does not choose.
    pub default_max_attempts: u32,
    /// Upper bound accepted from submitters.
    pub max_attempts_limit: u32,
    pub lease_ttl_secs: u64,
    pub poll_interval_ms: u64,
    /// Jobs leased per scheduler pass.
    pub batch_size: usize,
    /// Transport calls in flight across all jobs.
    pub dispatch_concurrency: usize,
    pub transport_timeout_secs: u64,
    pub retry_strategy: RetryStrategy,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_secs: u64,
    pub destination_burst: u32,
    pub destination_rate_per_sec: f64,
    pub global_burst: u32,
    pub global_rate_per_sec: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            max_attempts_limit: 10,
            lease_ttl_secs: 120,
            poll_interval_ms: 5_000,
            batch_size: 100,
            dispatch_concurrency: 16,
            transport_timeout_secs: 30,
            retry_strategy: RetryStrategy::Exponential,
            retry_initial_backoff_ms: 2_000,
            retry_max_backoff_secs: 3_600,
            destination_burst: 3,
            destination_rate_per_sec: 1.0,
            global_burst: 30,
            global_rate_per_sec: 30.0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("default_max_attempts", u64::from(self.default_max_attempts)),
            ("max_attempts_limit", u64::from(self.max_attempts_limit)),
            ("lease_ttl_secs", self.lease_ttl_secs),
            ("poll_interval_ms", self.poll_interval_ms),
            ("batch_size", self.batch_size as u64),
            ("dispatch_concurrency", self.dispatch_concurrency as u64),
            ("transport_timeout_secs", self.transport_timeout_secs),
            ("retry_initial_backoff_ms", self.retry_initial_backoff_ms),
            ("retry_max_backoff_secs", self.retry_max_backoff_secs),
            ("destination_burst", u64::from(self.destination_burst)),
            ("global_burst", u64::from(self.global_burst)),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(JobError::ConfigError(format!(
                    "{} must be greater than zero",
                    field
                )));
            }
        }

        for (field, rate) in [
            ("destination_rate_per_sec", self.destination_rate_per_sec),
            ("global_rate_per_sec", self.global_rate_per_sec),
        ] {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(JobError::ConfigError(format!(
                    "{} must be a positive number",
                    field
                )));
            }
        }

        if self.lease_ttl_secs <= self.transport_timeout_secs {
            return Err(JobError::ConfigError(
                "lease_ttl_secs must exceed transport_timeout_secs".to_string(),
            ));
        }

        if self.default_max_attempts > self.max_attempts_limit {
            return Err(JobError::ConfigError(
                "default_max_attempts exceeds max_attempts_limit".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.retry_strategy,
            Duration::from_millis(self.retry_initial_backoff_ms),
            Duration::from_secs(self.retry_max_backoff_secs),
        )
    }

    pub fn destination_bucket(&self) -> BucketConfig {
        BucketConfig::new(self.destination_burst, self.destination_rate_per_sec)
    }

    pub fn global_bucket(&self) -> BucketConfig {
        BucketConfig::new(self.global_burst, self.global_rate_per_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.backoff().delay_for(0), Duration::from_secs(2));
    }

    #[test]
    fn zero_values_are_rejected() {
        let config = EngineConfig {
            dispatch_concurrency: 0,
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dispatch_concurrency"));

        let config = EngineConfig {
            global_rate_per_sec: 0.0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn lease_must_outlive_a_transport_call() {
        let config = EngineConfig {
            lease_ttl_secs: 30,
            transport_timeout_secs: 30,
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lease_ttl_secs"));

        let config = EngineConfig {
            lease_ttl_secs: 31,
            ..config
        };
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"batch_size": 5, "retry_strategy": "fixed"}"#).unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.retry_strategy, RetryStrategy::Fixed);
        assert_eq!(config.lease_ttl_secs, 120);
    }
}
