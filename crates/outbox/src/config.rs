//! Outbox worker configuration

use std::time::Duration;

pub use relaybox_retention::ErrorCallback;
use relaybox_retention::nop_error_callback;

/// Default interval between worker iterations; the jittered tick adds a
/// backoff delay on top of it.
pub const DEFAULT_ITERATION_RATE: Duration = Duration::from_secs(5);
/// Default upper bound of the per-tick jitter factor.
pub const DEFAULT_ITERATION_SEED: u32 = 2;
/// Default deadline for a single broker publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration of the [`Outbox`](crate::Outbox) engine.
#[derive(Clone)]
pub struct Config {
    pub(crate) iteration_rate: Duration,
    pub(crate) iteration_seed: u32,
    pub(crate) publish_timeout: Duration,
    pub(crate) retention: relaybox_retention::Config,
    pub(crate) on_error: ErrorCallback,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iteration_rate: DEFAULT_ITERATION_RATE,
            iteration_seed: DEFAULT_ITERATION_SEED,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            retention: relaybox_retention::Config::default(),
            on_error: nop_error_callback(),
        }
    }
}

impl Config {
    /// Set the base interval between worker iterations.
    #[must_use]
    pub fn with_iteration_rate(mut self, rate: Duration) -> Self {
        self.iteration_rate = rate;
        self
    }

    /// Set the upper bound of the jitter factor sampled each tick.
    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_iteration_seed(mut self, seed: u32) -> Self {
        self.iteration_seed = seed.max(1);
        self
    }

    /// Set the deadline for a single broker publish.
    #[must_use]
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Set how often the retention sweeper runs and how many days of rows
    /// it keeps.
    #[must_use]
    pub fn with_retention(mut self, erase_interval: Duration, window_days: i64) -> Self {
        self.retention.erase_interval = erase_interval;
        self.retention.window_days = window_days;
        self
    }

    /// Set the callback invoked with every iteration or publish error.
    ///
    /// The same callback also receives retention sweep errors.
    #[must_use]
    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = callback.clone();
        self.retention.on_error = callback;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();

        assert_eq!(config.iteration_rate, Duration::from_secs(5));
        assert_eq!(config.iteration_seed, 2);
        assert_eq!(config.publish_timeout, Duration::from_secs(2));
    }

    #[test]
    fn iteration_seed_is_clamped_to_at_least_one() {
        let config = Config::default().with_iteration_seed(0);

        assert_eq!(config.iteration_seed, 1);
    }
}
