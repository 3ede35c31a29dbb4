use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logging::targets;

use super::{Flow, Request};

/// Configuration for retry behavior on transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A configuration that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), with ±10% jitter.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64);

        let jitter = (rand::random::<f64>() * 0.2) - 0.1;
        Duration::from_millis((delay_ms * (1.0 + jitter)).max(0.0) as u64)
    }
}

/// Bounds the number of attempts of a chain run.
///
/// The guard itself only observes requests; the chain driver consults it
/// when a step fails or asks for a retry.
#[derive(Debug, Clone)]
pub struct RetryGuard {
    config: RetryConfig,
}

impl RetryGuard {
    /// Create a guard.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries.saturating_add(1)
    }

    /// Whether a failure of `attempt` should start another attempt.
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts()
    }

    /// Backoff before the attempt following `attempt`.
    pub fn delay_for_retry(&self, attempt: u32) -> Duration {
        self.config.delay_for_retry(attempt)
    }

    pub(super) fn process(&self, request: &mut Request) -> Result<Flow> {
        if request.attempt() > 1 {
            tracing::debug!(
                target: targets::CHAIN,
                attempt = request.attempt(),
                max_attempts = self.max_attempts(),
                "Starting retry attempt"
            );
        }
        Ok(Flow::Proceed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
        };

        let first = config.delay_for_retry(1).as_millis();
        assert!((90..=110).contains(&first), "first delay was {first}");

        let third = config.delay_for_retry(3).as_millis();
        assert!((360..=440).contains(&third), "third delay was {third}");

        let capped = config.delay_for_retry(10).as_millis();
        assert!(capped <= 1100, "capped delay was {capped}");
    }

    #[test]
    fn test_should_retry_bounds_attempts() {
        let guard = RetryGuard::new(RetryConfig {
            max_retries: 2,
            ..RetryConfig::default()
        });
        let err = Error::transport("timeout");

        assert_eq!(guard.max_attempts(), 3);
        assert!(guard.should_retry(&err, 1));
        assert!(guard.should_retry(&err, 2));
        assert!(!guard.should_retry(&err, 3));
        assert!(!guard.should_retry(&Error::Parse("bad".into()), 1));
    }

    #[test]
    fn test_no_retries() {
        let guard = RetryGuard::new(RetryConfig::no_retries());
        assert!(!guard.should_retry(&Error::transport("timeout"), 1));
    }
}
