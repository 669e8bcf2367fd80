//! Restart Backoff Policy
//!
//! Exponential backoff between engine restarts:
//! `delay(attempt) = min(initial * multiplier^attempt, max)`, with optional
//! jitter. The attempt counter only resets once the engine has run for the
//! configured stable period.

use std::time::Duration;

use rand::Rng;

/// Configuration for restart backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first restart.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.0 disables it).
    pub jitter_factor: f64,
    /// Uninterrupted run time after which the attempt counter resets.
    pub stable_run: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter_factor: 0.0,
            stable_run: Duration::from_secs(60),
        }
    }
}

/// Backoff state for one supervisor.
///
/// # Example
///
/// ```rust
/// use ctp_bridge::infrastructure::supervisor::{BackoffConfig, BackoffPolicy};
/// use std::time::Duration;
///
/// let mut policy = BackoffPolicy::new(BackoffConfig::default());
/// assert_eq!(policy.next_delay(), Duration::from_secs(1));
/// assert_eq!(policy.next_delay(), Duration::from_secs(2));
///
/// // Engine ran long enough
/// policy.reset();
/// assert_eq!(policy.attempt(), 0);
/// ```
#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    attempt: u32,
}

impl BackoffPolicy {
    /// Create a new policy.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Attempts since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for `attempt`, before jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.config.multiplier.powi(exponent);
        let scaled = self.config.initial_delay.as_secs_f64() * factor;
        if !scaled.is_finite() || scaled >= self.config.max_delay.as_secs_f64() {
            return self.config.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }

    /// Delay before the next restart; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.apply_jitter(delay)
    }

    /// Reset the attempt counter if the engine ran for at least `stable_run`.
    ///
    /// Returns `true` if the counter was reset.
    pub const fn record_run(&mut self, ran_for: Duration) -> bool {
        if ran_for.as_nanos() >= self.config.stable_run.as_nanos() {
            self.reset();
            true
        } else {
            false
        }
    }

    /// Reset the attempt counter.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        let base = duration.as_secs_f64();
        let range = base * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-range..=range);
        Duration::from_secs_f64((base + jitter).max(0.001)).min(self.config.max_delay)
    }
}
