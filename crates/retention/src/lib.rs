//! Table retention sweeper
//!
//! Periodically deletes rows whose `created_at` date fell out of the
//! retention window. Both the inbox and the outbox run one sweeper next to
//! their worker loop; it is the only cleanup for rows stuck in `progress`
//! after a crashed worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default period between sweeps.
pub const DEFAULT_ERASE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default retention window in days.
pub const DEFAULT_RETENTION_WINDOW_DAYS: i64 = 60;

/// Callback invoked with every sweep error. Shared with the engine configs.
pub type ErrorCallback = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Callback that ignores the error.
#[must_use]
pub fn nop_error_callback() -> ErrorCallback {
    Arc::new(|_| {})
}

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("retention database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Sweeper configuration.
///
/// Zero or negative fields fall back to their defaults.
#[derive(Clone)]
pub struct Config {
    pub erase_interval: Duration,
    pub window_days: i64,
    pub on_error: ErrorCallback,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            erase_interval: DEFAULT_ERASE_INTERVAL,
            window_days: DEFAULT_RETENTION_WINDOW_DAYS,
            on_error: nop_error_callback(),
        }
    }
}

/// Retention policy bound to a single table.
pub struct Policy {
    pool: PgPool,
    table_name: String,
    config: Config,
}

impl Policy {
    pub fn new(pool: PgPool, table_name: impl Into<String>, config: Config) -> Self {
        let mut config = config;

        if config.erase_interval.is_zero() {
            config.erase_interval = DEFAULT_ERASE_INTERVAL;
        }

        if config.window_days <= 0 {
            config.window_days = DEFAULT_RETENTION_WINDOW_DAYS;
        }

        Self {
            pool,
            table_name: table_name.into(),
            config,
        }
    }

    /// Sweep every `erase_interval` until the token is cancelled.
    ///
    /// Sweep errors are reported through the error callback; the loop keeps
    /// running.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.erase_interval) => {}
            }

            let tail = tail_date(Utc::now(), self.config.window_days);

            match self.erase(tail).await {
                Ok(0) => debug!(table = %self.table_name, "retention sweep removed no rows"),
                Ok(deleted) => {
                    info!(table = %self.table_name, deleted, "retention sweep removed rows");
                }
                Err(err) => {
                    warn!(table = %self.table_name, error = %err, "retention sweep failed");
                    (self.config.on_error)(&anyhow::Error::new(err));
                }
            }
        }
    }

    /// Delete every row created strictly before `tail`'s date.
    async fn erase(&self, tail: DateTime<Utc>) -> Result<u64, RetentionError> {
        let query = format!(
            "delete from {} where created_at::date < $1::date;",
            self.table_name,
        );

        let result = sqlx::query(&query)
            .bind(tail.naive_utc())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Oldest creation date that is still retained.
fn tail_date(now: DateTime<Utc>, window_days: i64) -> DateTime<Utc> {
    now - chrono::Duration::days(window_days)
}
