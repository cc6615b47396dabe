// src/backoff.rs
// Exponential backoff with jitter, shared by broker reconnects and resubscriptions.

use rand::Rng;
use std::time::Duration;

/// Upper bound for any single wait.
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// Relative jitter applied around the nominal delay.
const JITTER: f64 = 0.15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max: max.max(initial),
        }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Nominal wait before retry `attempt` (zero based): doubles per attempt, capped at `max`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// [`base_delay`](Self::base_delay) with up to 15% jitter either way, never above `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let factor = 1.0 + rand::rng().random_range(-JITTER..=JITTER);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_secs(1), MAX_DELAY)
    }
}
