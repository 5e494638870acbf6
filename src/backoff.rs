//! Jittered exponential backoff.
//!
//! Used for two things: retrying store contention (busy leases, SQLite busy)
//! inside the engine, and spacing out chat fetches after consecutive
//! failures in the ingestion loop.

use std::time::Duration;

use rand::Rng;

/// Doubles from `initial` up to `max`; each delay is uniform in [0, current].
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
    max_exponent: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        // 2^max_exponent * initial <= max
        let initial_millis = initial.as_millis() as u64;
        let max_millis = max.as_millis() as u64;
        let max_exponent = if initial_millis > 0 && max_millis >= initial_millis {
            (max_millis / initial_millis).ilog2()
        } else {
            0
        };

        Self {
            initial,
            max,
            attempt: 0,
            max_exponent: max_exponent.min(20),
        }
    }

    /// Short delays for lease and SQLite busy retries.
    pub fn for_store() -> Self {
        Self::new(Duration::from_millis(25), Duration::from_secs(1))
    }

    /// Extra wait after failed chat fetches, capped at five minutes.
    pub fn for_fetch(interval: Duration) -> Self {
        Self::new(interval, Duration::from_secs(300))
    }

    /// Next delay, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(self.max_exponent);
        let ceiling = (self.initial.as_millis() as u64)
            .saturating_mul(1u64 << exp)
            .min(self.max.as_millis() as u64);
        self.attempt = self.attempt.saturating_add(1);

        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
