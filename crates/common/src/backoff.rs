//! Capped exponential backoff
//!
//! `delay(n) = min(base * factor^n, max)`, optionally scaled by a random
//! factor in `[0.5, 1.5]` so that workers failing together do not retry
//! together.

use std::time::Duration;

use rand::RngExt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            max: Duration::from_secs(5),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Default::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let raw_ms = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);
        let ms = if self.jitter {
            raw_ms * rand::rng().random_range(0.5..=1.5)
        } else {
            raw_ms
        };
        Duration::from_millis(ms as u64)
    }
}
