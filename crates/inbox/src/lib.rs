//! Transactional inbox worker
//!
//! Incoming broker events are persisted before they are handled: the writer
//! fans every event out to one row per registered handler, and a background
//! loop claims the rows and dispatches them with retry, timeout and
//! dead-lettering. Handlers must be idempotent, delivery is at-least-once.

mod client;
mod config;
mod migrations;
mod record;
mod registry;
mod storage;

pub use client::Client;
pub use config::{
    Config, DEFAULT_HANDLER_TIMEOUT, DEFAULT_ITERATION_RATE, DEFAULT_ITERATION_SEED,
    DEFAULT_MAX_RETRY_ATTEMPTS, DeadCallback, ErrorCallback,
};
pub use record::{Record, Status};
pub use registry::{Handler, Registry};

use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relaybox_backoff::{Backoff, Ticker};
use relaybox_retention::Policy;

use registry::HandlerMap;
use storage::Storage;

/// Errors produced by the inbox engine.
#[derive(Debug, Error)]
pub enum InboxError {
    #[error("inbox database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migration(#[from] relaybox_migration::MigrationError),

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// The inbox engine: owns the worker loop and the retention sweeper.
///
/// The engine works on a snapshot of the registry taken at construction
/// time. Rows addressed to handlers missing from the snapshot are requeued
/// untouched, so a redeployment with more handlers picks them up.
pub struct Inbox {
    handlers: HandlerMap,
    storage: Arc<Storage>,
    config: Config,
    cancel: CancellationToken,
}

impl Inbox {
    pub fn new(registry: &Registry, pool: PgPool, config: Config) -> Self {
        Self {
            handlers: registry.handlers(),
            storage: Arc::new(Storage::new(pool)),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Client that fans incoming events out to handler rows.
    pub fn writer(&self) -> Client {
        Client::new(Arc::clone(&self.storage), &self.handlers)
    }

    /// Bootstrap the schema and spawn the worker loop and the retention
    /// sweeper. Returns once both are running; a migration failure is fatal.
    pub async fn start(&self) -> Result<(), InboxError> {
        self.storage.init().await?;

        let worker = Worker {
            handlers: self.handlers.clone(),
            storage: Arc::clone(&self.storage),
            config: self.config.clone(),
            backoff: Backoff::default(),
        };
        tokio::spawn(worker.run(self.cancel.child_token()));

        let policy = Policy::new(
            self.storage.pool().clone(),
            storage::TABLE_NAME,
            self.config.retention.clone(),
        );
        tokio::spawn(policy.run(self.cancel.child_token()));

        Ok(())
    }

    /// Stop the worker loop and the sweeper. The in-flight iteration is
    /// allowed to finish. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

struct Worker {
    handlers: HandlerMap,
    storage: Arc<Storage>,
    config: Config,
    backoff: Backoff,
}

impl Worker {
    async fn run(self, cancel: CancellationToken) {
        let mut ticker = Ticker::new(
            self.backoff.clone(),
            self.config.iteration_rate,
            self.config.iteration_seed,
        );

        info!(
            iteration_rate = ?self.config.iteration_rate,
            handler_timeout = ?self.config.handler_timeout,
            max_retry_attempts = self.config.max_retry_attempts,
            "inbox worker starting",
        );

        loop {
            let tick = tokio::select! {
                () = cancel.cancelled() => break,
                tick = ticker.tick() => tick,
            };

            if tick.is_none() {
                break;
            }

            // The iteration is awaited outside the select so cancellation
            // never aborts it mid-record.
            if let Err(err) = self.iteration().await {
                warn!(error = %err, "inbox iteration failed");
                (self.config.on_error)(&anyhow::Error::new(err));
            }
        }

        ticker.stop();
        info!("inbox worker stopped");
    }

    /// Claim eligible rows, dispatch them to their handlers and persist the
    /// resulting states.
    async fn iteration(&self) -> Result<(), InboxError> {
        let mut records = self.storage.fetch(Utc::now()).await?;

        if records.is_empty() {
            return Ok(());
        }

        for record in &mut records {
            let Some(handlers) = self.handlers.get(record.event_type()) else {
                debug!(
                    record_id = %record.id(),
                    event_type = %record.event_type(),
                    "no handlers for event type, record requeued",
                );
                record.requeue();
                continue;
            };

            let Some(handler) = handlers
                .iter()
                .find(|handler| handler.key() == record.handler_key())
            else {
                debug!(
                    record_id = %record.id(),
                    handler_key = %record.handler_key(),
                    "handler key not registered, record requeued",
                );
                record.requeue();
                continue;
            };

            let outcome = tokio::time::timeout(
                self.config.handler_timeout,
                handler.process(record.payload()),
            )
            .await;

            match outcome {
                Ok(Ok(())) => record.done(),
                Ok(Err(err)) => self.fail_or_dead(record, &err.to_string()),
                Err(_) => self.fail_or_dead(
                    record,
                    &format!("handler timed out after {:?}", self.config.handler_timeout),
                ),
            }
        }

        let unfinished = records
            .iter()
            .filter(|record| record.status() == Some(Status::Progress))
            .count();
        if unfinished > 0 {
            warn!(
                unfinished,
                total = records.len(),
                "claimed records left unfinished after iteration",
            );
        }

        self.storage.update(&records).await
    }

    /// Mark a failed handler call, transitioning to `dead` once the retry
    /// budget is spent and scheduling the next attempt otherwise.
    fn fail_or_dead(&self, record: &mut Record, message: &str) {
        record.fail(message);

        if record.attempt() >= self.config.max_retry_attempts {
            record.dead();
            warn!(
                record_id = %record.id(),
                handler_key = %record.handler_key(),
                attempt = record.attempt(),
                "record exhausted its retries",
            );
            (self.config.on_dead)(record.id(), message);

            return;
        }

        let delay = self.backoff.next(record.attempt());
        record.calc_new_deadline(delay);
    }
}
