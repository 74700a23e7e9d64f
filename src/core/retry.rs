//! Retry policy evaluation.
//!
//! A [`RetrySpec`] decides, for a failed attempt, whether the stage runs again
//! and after how long. Very high attempt ceilings with a gentle backoff rate
//! turn a stage into a poll-until-ready loop for long-running external jobs.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::workflow::ConfigError;
use crate::domain::FailureKind;

/// Retry policy for a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Failure kinds that may be retried (empty = every kind)
    #[serde(default)]
    pub retry_on: HashSet<FailureKind>,

    /// Delay before the second attempt, in milliseconds
    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    /// Multiplier applied to the delay after each failed attempt
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,

    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Optional upper bound on a single delay, in milliseconds
    #[serde(default)]
    pub max_interval_ms: Option<u64>,
}

fn default_interval() -> u64 {
    1000
}
fn default_backoff_rate() -> f64 {
    2.0
}
fn default_max_attempts() -> u32 {
    3
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            retry_on: HashSet::new(),
            interval_ms: default_interval(),
            backoff_rate: default_backoff_rate(),
            max_attempts: default_max_attempts(),
            max_interval_ms: None,
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the stage again after this delay
    Retry(Duration),

    /// Hand the failure to the catch route
    Exhausted,
}

impl RetrySpec {
    /// A single attempt; every failure goes straight to the catch route
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Poll-until-ready: only `transient` failures are retried
    pub fn poll(interval_ms: u64, backoff_rate: f64, max_attempts: u32) -> Self {
        Self {
            retry_on: [FailureKind::Transient].into_iter().collect(),
            interval_ms,
            backoff_rate,
            max_attempts,
            max_interval_ms: None,
        }
    }

    /// Reject specs the executor cannot honour
    pub fn validate(&self, stage: &str) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::MaxAttempts {
                stage: stage.to_string(),
                max_attempts: self.max_attempts,
            });
        }

        if !self.backoff_rate.is_finite() || self.backoff_rate < 1.0 {
            return Err(ConfigError::BackoffRate {
                stage: stage.to_string(),
                backoff_rate: self.backoff_rate,
            });
        }

        Ok(())
    }

    /// Whether this kind of failure is covered by the policy
    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        self.retry_on.is_empty() || self.retry_on.contains(&kind)
    }

    /// Delay after the given failed attempt (1-indexed)
    ///
    /// `interval * backoff_rate^(attempt-1)`, saturating at the largest
    /// representable delay and clipped to `max_interval_ms` when set.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.interval_ms as f64 * self.backoff_rate.powi(exponent);

        // `as` saturates: +inf becomes u64::MAX
        let mut millis = delay as u64;
        if let Some(cap) = self.max_interval_ms {
            millis = millis.min(cap);
        }

        Duration::from_millis(millis)
    }

    /// Check if we should retry based on attempt count alone
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Decide what happens after attempt number `attempt` failed with `kind`
    pub fn decide(&self, kind: FailureKind, attempt: u32) -> RetryDecision {
        if !self.is_retryable(kind) || !self.should_retry(attempt) {
            return RetryDecision::Exhausted;
        }

        RetryDecision::Retry(self.delay_for_attempt(attempt))
    }
}
