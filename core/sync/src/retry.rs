//! Retry budget and exponential backoff for retryable send failures.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of sends per operation. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay after the first failed send.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration with an attempt budget.
    pub fn new(max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier. Values below 1.0 are clamped to 1.0.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Check whether an operation that has made `attempt` sends may not be
    /// sent again.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }

    /// Unjittered delay after the `attempt`-th send failed, in milliseconds.
    fn capped_millis(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.max(1.0).powi(exponent);

        base_delay.min(self.max_delay.as_millis() as f64)
    }

    /// Calculate the backoff delay after the `attempt`-th send failed.
    ///
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    /// Jitter only shortens a delay (by up to 25%) and never below the
    /// previous attempt's unjittered delay, so successive delays for the
    /// same operation never decrease.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped_delay = self.capped_millis(attempt);

        let final_delay = if self.jitter {
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.25);
            let floor = if attempt > 1 {
                self.capped_millis(attempt - 1)
            } else {
                0.0
            };
            (capped_delay * jitter_factor).max(floor)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(None)
    }
}
