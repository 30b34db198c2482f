//! Bounded exponential backoff with jitter
//!
//! Provides the duration generator used for inbox retry scheduling and the
//! jittered ticker that drives both worker loops.

mod ticker;

pub use ticker::Ticker;

use std::time::Duration;

use rand::RngExt;

/// Default lower bound of a generated delay.
pub const DEFAULT_MIN_DURATION: Duration = Duration::from_secs(5);
/// Default upper bound of a generated delay.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(60);
/// Default growth factor of the exponential curve.
pub const DEFAULT_FACTOR: f64 = 2.0;

/// Tuning knobs for [`Backoff`].
///
/// Zero or negative fields fall back to their defaults.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub min: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_DURATION,
            max: DEFAULT_MAX_DURATION,
            factor: DEFAULT_FACTOR,
        }
    }
}

/// Generator of exponentially growing, jittered delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: Config,
}

impl Backoff {
    pub fn new(config: Config) -> Self {
        let mut config = config;

        if config.min.is_zero() {
            config.min = DEFAULT_MIN_DURATION;
        }

        if config.max.is_zero() {
            config.max = DEFAULT_MAX_DURATION;
        }

        if config.factor <= 0.0 {
            config.factor = DEFAULT_FACTOR;
        }

        Self { config }
    }

    /// Delay before the given attempt.
    ///
    /// A negative attempt is treated as incorrect input and yields the
    /// maximum delay. Attempt zero yields exactly the minimum. Otherwise the
    /// delay is sampled uniformly from `[min, min * factor^attempt)` and
    /// clamped to `[min, max]`.
    pub fn next(&self, attempt: i32) -> Duration {
        if attempt < 0 {
            return self.config.max;
        }

        if attempt == 0 {
            return self.config.min;
        }

        let min = self.config.min.as_secs_f64();
        let max = self.config.max.as_secs_f64();

        let ceiling = min * self.config.factor.powi(attempt);
        let sampled = rand::rng().random::<f64>() * (ceiling - min) + min;

        if !sampled.is_finite() || sampled >= max {
            return self.config.max;
        }

        if sampled <= min {
            return self.config.min;
        }

        Duration::from_secs_f64(sampled)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
