//! Per-client exponential-backoff-with-jitter calculator.
//!
//! Deterministic from `(client_id, config_seed)`: two `Backoff` instances
//! constructed with the same seed produce identical delay sequences, which
//! is what makes restarted clients keep their jitter phase and what makes
//! multi-run comparisons reproducible (spec invariant: determinism).

use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

/// Uptime threshold above which a clean restart resets the backoff state.
pub const RESET_UPTIME_THRESHOLD: Duration = Duration::from_secs(30);

/// Configuration for a single client's backoff sequence.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Jitter fraction in `[0.0, 1.0]`; a value of 0.2 means delay is adjusted
    /// by a uniform amount in `[-10%, +10%]` of itself.
    pub jitter_pct: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_pct: 0.2,
        }
    }
}

/// Deterministic, reseedable exponential-backoff sequence for one client.
///
/// The client's jitter stream is seeded from `client_id XOR config_seed`, so
/// any two runs with the same config seed produce bit-identical delay
/// sequences per client, while different clients decorrelate from each
/// other.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
    rng: Pcg64,
    seed: u64,
}

impl Backoff {
    pub fn new(client_id: u64, config_seed: u64, config: BackoffConfig) -> Self {
        let seed = client_id ^ config_seed;
        Self {
            config,
            attempts: 0,
            rng: Pcg64::seed_from_u64(seed),
            seed,
        }
    }

    /// Produce the next delay duration and advance the attempt counter.
    pub fn next(&mut self) -> Duration {
        let base = self.raw_delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        self.apply_jitter(base)
    }

    /// Peek at what the next delay would be without advancing state.
    pub fn peek(&mut self) -> Duration {
        let base = self.raw_delay(self.attempts);
        self.apply_jitter(base)
    }

    fn raw_delay(&self, attempts: u32) -> Duration {
        let initial_ms = self.config.initial.as_secs_f64() * 1000.0;
        let max_ms = self.config.max.as_secs_f64() * 1000.0;
        let scaled = initial_ms * self.config.multiplier.powi(attempts as i32);
        Duration::from_secs_f64(scaled.min(max_ms).max(0.0) / 1000.0)
    }

    fn apply_jitter(&mut self, delay: Duration) -> Duration {
        if self.config.jitter_pct <= 0.0 {
            return delay;
        }
        let half = self.config.jitter_pct / 2.0;
        let factor: f64 = self.rng.random_range(-half..=half);
        let delay_secs = delay.as_secs_f64();
        let jittered = (delay_secs + delay_secs * factor).max(0.0);
        Duration::from_secs_f64(jittered)
    }

    /// Reset the attempt counter. Does not reseed the RNG: the jitter stream
    /// keeps advancing so repeated resets don't replay identical jitter.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Whether a completed run should reset the backoff state, per
    /// `ShouldReset(uptime, exitCode) = (uptime >= 30s) || (exitCode == 0)`.
    pub fn should_reset(uptime: Duration, exit_code: i32) -> bool {
        uptime >= RESET_UPTIME_THRESHOLD || exit_code == 0
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}
