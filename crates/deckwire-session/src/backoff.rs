use std::time::Duration;

use rand::Rng;

/// Largest accepted jitter fraction.
pub const MAX_JITTER: f64 = 0.5;

/// Reconnect delay policy.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Fraction of each delay that may be randomly shaved off (0.0..=0.5).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// Exponential backoff with downward jitter.
///
/// The base delay doubles per attempt up to `max`. Jitter removes up to
/// `jitter` of the base, but a delay is never shorter than the one before
/// it, so the sequence is non-decreasing and bounded by `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    /// Start a fresh sequence.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Delay before the next attempt, using the thread-local RNG.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// Delay before the next attempt, drawing jitter from `rng`.
    pub fn next_delay_with<R: Rng>(&mut self, rng: &mut R) -> Duration {
        let max = self.config.max.max(self.config.initial);
        let base = self
            .config
            .initial
            .checked_mul(2u32.saturating_pow(self.attempt))
            .map_or(max, |d| d.min(max));

        let jitter = self.config.jitter.clamp(0.0, MAX_JITTER);
        let shaved = if jitter > 0.0 {
            base.mul_f64(jitter * rng.gen::<f64>())
        } else {
            Duration::ZERO
        };

        let delay = base.saturating_sub(shaved).max(self.last).min(max);
        self.attempt = self.attempt.saturating_add(1);
        self.last = delay;
        delay
    }

    /// Number of delays handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Restart from the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }
}
