//! Exponential backoff between task attempts.

use std::time::Duration;

use rand::Rng;

/// Doubling backoff with random jitter, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: true,
        }
    }

    /// No delay at all between attempts.
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `retry` (1 for the first retry).
    ///
    /// `base * 2^(retry - 1)`, plus up to 25% jitter, never above `max`.
    ///
    /// With jitter the doubled delay is held to 80% of `max` so capped
    /// retries still spread out instead of all firing at `max`.
    pub fn delay(&self, retry: u32) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }
        let exponent = retry.saturating_sub(1).min(16);
        let doubled = self.base.saturating_mul(1u32 << exponent);
        if !self.jitter {
            return doubled.min(self.max);
        }
        let raw = doubled.min(self.max.mul_f64(0.8));
        let spread = (raw.as_millis() / 4) as u64;
        let extra = rand::thread_rng().gen_range(0..=spread);
        (raw + Duration::from_millis(extra)).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}
