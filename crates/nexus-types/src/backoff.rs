//! Exponential backoff with jitter, used by reconnect and retry loops.

use rand::Rng;
use std::time::Duration;

/// Growing delay between attempts, capped at `max`, with ± `jitter` spread.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    min: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    current: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    /// Reconnect defaults: 1s → 30s, ×2, 20% jitter.
    #[must_use]
    pub fn reconnect() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2.0, 0.2)
    }

    #[must_use]
    pub fn new(min: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            min,
            max: max.max(min),
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            current: min,
            attempts: 0,
        }
    }

    /// Delay before the next attempt. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.attempts = self.attempts.saturating_add(1);
        self.current = self.current.mul_f64(self.multiplier).min(self.max);

        if self.jitter == 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }

    /// Back to the minimum delay after a success.
    pub fn reset(&mut self) {
        self.current = self.min;
        self.attempts = 0;
    }

    /// Delays handed out since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
