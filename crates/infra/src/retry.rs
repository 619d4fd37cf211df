//! Backoff schedule for acknowledgement delivery.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the wait grows between delivery attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    #[default]
    Exponential,
    /// `base * attempt`, capped at `max_delay`.
    Linear,
}

/// Bounded retry schedule for reaching a counter-branch.
///
/// `max_attempts` counts every attempt including the first; anything below 1
/// behaves as 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction of the delay (0.0 to 1.0) the schedule may drift either way.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_millis(200), Duration::from_secs(10))
    }
}

impl RetryPolicy {
    /// Same wait between every attempt, no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Doubling waits with 10 % jitter.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Whether attempt `attempt` (1-indexed) may be followed by another.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Wait after failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(exponent) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };

        let nominal = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(1 << exponent.min(20))
                .min(self.max_delay),
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt).min(self.max_delay),
        };

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter.is_nan() || jitter == 0.0 {
            return nominal;
        }
        // reproducible spread in [-1, 1) keyed by the attempt number
        let spread = f64::from(attempt.wrapping_mul(17) % 100) / 50.0 - 1.0;
        nominal.mul_f64(1.0 + jitter * spread)
    }
}
