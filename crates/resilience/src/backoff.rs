//! Exponential backoff with additive jitter
//!
//! Delay for attempt `i` is `min(base_delay * factor^i, max_delay)` plus a
//! uniform random draw from `[0, JITTER_RANGE_MS)`. The jitter range is a
//! fixed crate constant rather than a fraction of the computed delay, so
//! independent clients desynchronize even when they all sit at `max_delay`.

use std::time::Duration;

use rand::Rng;

use crate::error::RetryError;

/// Width of the additive jitter window in milliseconds.
///
/// Applied on top of the capped exponential delay; the jittered result may
/// exceed `max_delay` by up to this amount.
pub const JITTER_RANGE_MS: u64 = 1000;

/// Cap on the backoff exponent to keep the f64 computation finite.
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap applied to the pre-jitter delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt; must be greater than 1
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Validate the policy parameters.
    pub fn validate(&self) -> Result<(), RetryError> {
        if self.base_delay.is_zero() {
            return Err(RetryError::InvalidConfig {
                message: "base_delay must be positive".to_string(),
            });
        }
        if self.base_delay > self.max_delay {
            return Err(RetryError::InvalidConfig {
                message: format!(
                    "base_delay ({:?}) cannot exceed max_delay ({:?})",
                    self.base_delay, self.max_delay
                ),
            });
        }
        if self.factor <= 1.0 {
            return Err(RetryError::InvalidConfig {
                message: format!("backoff factor must be greater than 1, got {}", self.factor),
            });
        }
        Ok(())
    }

    /// Pre-jitter delay for the given attempt index.
    ///
    /// Non-decreasing in `attempt` and never below `base_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_BACKOFF_EXPONENT);
        let raw = self.base_delay.as_millis() as f64 * self.factor.powi(exponent as i32);
        let capped = raw.min(self.max_delay.as_millis() as f64) as u64;
        Duration::from_millis(capped.max(self.base_delay.as_millis() as u64))
    }

    /// Delay for the given attempt with additive jitter applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..JITTER_RANGE_MS);
        self.delay_for(attempt) + Duration::from_millis(jitter)
    }
}
