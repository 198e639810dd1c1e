//! Backoff schedule for per-item network retries.

use bottlesync_core::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff: the delay doubles from `base` per retry, capped at `max`,
/// then spread by ±`jitter`.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    retries: u32,
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(retries: u32, base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            retries,
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter,
        )
    }

    /// Retries allowed after the first attempt.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before retry number `retry` (0-based), jittered.
    pub fn delay(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        if self.jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(1.0 + spread)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
