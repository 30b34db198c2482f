//! Inbox worker configuration

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

pub use relaybox_retention::ErrorCallback;
use relaybox_retention::nop_error_callback;

/// Default interval between worker iterations; the jittered tick adds a
/// backoff delay on top of it.
pub const DEFAULT_ITERATION_RATE: Duration = Duration::from_secs(5);
/// Default upper bound of the per-tick jitter factor.
pub const DEFAULT_ITERATION_SEED: u32 = 2;
/// Default deadline for a single handler call.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(10);
/// Default number of failed attempts before a record goes dead.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: i32 = 5;

/// Callback invoked once per record that exhausts its retry budget.
pub type DeadCallback = Arc<dyn Fn(Uuid, &str) + Send + Sync>;

fn nop_dead_callback() -> DeadCallback {
    Arc::new(|_, _| {})
}

/// Configuration of the [`Inbox`](crate::Inbox) engine.
#[derive(Clone)]
pub struct Config {
    pub(crate) iteration_rate: Duration,
    pub(crate) iteration_seed: u32,
    pub(crate) handler_timeout: Duration,
    pub(crate) max_retry_attempts: i32,
    pub(crate) retention: relaybox_retention::Config,
    pub(crate) on_dead: DeadCallback,
    pub(crate) on_error: ErrorCallback,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iteration_rate: DEFAULT_ITERATION_RATE,
            iteration_seed: DEFAULT_ITERATION_SEED,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retention: relaybox_retention::Config::default(),
            on_dead: nop_dead_callback(),
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

    /// Set the deadline for a single handler call. A handler that exceeds
    /// it counts as failed.
    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set how many failed attempts a record gets before it goes dead.
    #[must_use]
    pub fn with_max_retry_attempts(mut self, attempts: i32) -> Self {
        self.max_retry_attempts = attempts;
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

    /// Set the callback invoked once per record that goes dead.
    #[must_use]
    pub fn on_dead(mut self, callback: DeadCallback) -> Self {
        self.on_dead = callback;
        self
    }

    /// Set the callback invoked with every iteration error.
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
        assert_eq!(config.handler_timeout, Duration::from_secs(10));
        assert_eq!(config.max_retry_attempts, 5);
    }

    #[test]
    fn iteration_seed_is_clamped_to_at_least_one() {
        let config = Config::default().with_iteration_seed(0);

        assert_eq!(config.iteration_seed, 1);
    }
}
