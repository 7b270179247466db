//! Reconnect backoff schedule.
//!
//! Exponential: base · 2^attempt, capped at a ceiling. The jittered
//! delay stays within ±10% of the schedule and never exceeds the
//! ceiling.

use std::time::Duration;

use rand::Rng;

/// Relative jitter applied around the base schedule.
pub const JITTER_RATIO: f64 = 0.10;

/// Largest exponent used before the ceiling always wins.
const MAX_EXPONENT: u32 = 20;

/// Exponential reconnect backoff with jitter.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    ceiling: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    /// Create a schedule starting at `base`, capped at `ceiling`.
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
            attempt: 0,
        }
    }

    /// Upper bound for any delay produced by this schedule.
    pub const fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Number of delays handed out since the last reset.
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Deterministic delay for a zero-based attempt: `min(base · 2^n, ceiling)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_EXPONENT);
        self.base
            .checked_mul(factor)
            .map_or(self.ceiling, |d| d.min(self.ceiling))
    }

    /// Apply a jitter factor in `[-JITTER_RATIO, JITTER_RATIO]` to the
    /// schedule for `attempt`, clamped to the ceiling.
    pub fn jittered_delay(&self, attempt: u32, jitter: f64) -> Duration {
        let jitter = jitter.clamp(-JITTER_RATIO, JITTER_RATIO);
        self.base_delay(attempt)
            .mul_f64(1.0 + jitter)
            .min(self.ceiling)
    }

    /// Next delay to sleep before reconnecting; advances the attempt.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
        let delay = self.jittered_delay(self.attempt, jitter);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to the first step (after a successful connect).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
