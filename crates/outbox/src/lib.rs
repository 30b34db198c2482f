//! Transactional outbox worker
//!
//! Applications write outgoing events into the outbox table inside their own
//! database transaction; a background loop later claims the rows, publishes
//! them to a broker and marks them delivered. Delivery is at-least-once:
//! a row is only finalized after the broker accepted it, so consumers must
//! be idempotent.

mod client;
mod config;
mod migrations;
mod record;
mod storage;

pub use client::Client;
pub use config::{
    Config, DEFAULT_ITERATION_RATE, DEFAULT_ITERATION_SEED, DEFAULT_PUBLISH_TIMEOUT, ErrorCallback,
};
pub use record::{Record, Status};

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use relaybox_backoff::{Backoff, Ticker};
use relaybox_retention::Policy;

use storage::Storage;

/// Message broker the outbox publishes to.
///
/// Publish errors are treated as transient: the record is requeued and
/// retried on a later tick.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, subject: &str, payload: &[u8]) -> anyhow::Result<()>;
}

/// Errors produced by the outbox engine.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migration(#[from] relaybox_migration::MigrationError),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("failed to encode payload of record {id}: {source}")]
    Marshal {
        id: Uuid,
        source: serde_json::Error,
    },
}

/// The outbox engine: owns the worker loop and the retention sweeper.
pub struct Outbox {
    broker: Arc<dyn Broker>,
    storage: Arc<Storage>,
    config: Config,
    cancel: CancellationToken,
}

impl Outbox {
    pub fn new(broker: Arc<dyn Broker>, pool: PgPool, config: Config) -> Self {
        Self {
            broker,
            storage: Arc::new(Storage::new(pool)),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Client that writes records inside the caller's transaction.
    pub fn writer(&self) -> Client {
        Client::new(Arc::clone(&self.storage))
    }

    /// Bootstrap the schema and spawn the worker loop and the retention
    /// sweeper. Returns once both are running; a migration failure is fatal.
    pub async fn start(&self) -> Result<(), OutboxError> {
        self.storage.init().await?;

        let worker = Worker {
            broker: Arc::clone(&self.broker),
            storage: Arc::clone(&self.storage),
            config: self.config.clone(),
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
    broker: Arc<dyn Broker>,
    storage: Arc<Storage>,
    config: Config,
}

impl Worker {
    async fn run(self, cancel: CancellationToken) {
        let mut ticker = Ticker::new(
            Backoff::default(),
            self.config.iteration_rate,
            self.config.iteration_seed,
        );

        info!(
            iteration_rate = ?self.config.iteration_rate,
            publish_timeout = ?self.config.publish_timeout,
            "outbox worker starting",
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
                warn!(error = %err, "outbox iteration failed");
                (self.config.on_error)(&anyhow::Error::new(err));
            }
        }

        ticker.stop();
        info!("outbox worker stopped");
    }

    /// Claim eligible rows, publish them and write the resulting statuses.
    async fn iteration(&self) -> Result<(), OutboxError> {
        let mut records = self.storage.fetch().await?;

        if records.is_empty() {
            return Ok(());
        }

        let mut marshal_error = None;

        for record in &mut records {
            let payload = match serde_json::to_vec(record.payload()) {
                Ok(payload) => payload,
                Err(err) => {
                    // Unrecoverable: the stored payload cannot be encoded.
                    // Finalize what we have and surface the error.
                    record.fail();
                    marshal_error = Some(OutboxError::Marshal {
                        id: record.id(),
                        source: err,
                    });
                    break;
                }
            };

            let publish = tokio::time::timeout(
                self.config.publish_timeout,
                self.broker.publish(record.event_type(), &payload),
            )
            .await;

            match publish {
                Ok(Ok(())) => record.done(),
                Ok(Err(err)) => {
                    record.requeue();
                    warn!(
                        record_id = %record.id(),
                        event_type = %record.event_type(),
                        error = %err,
                        "publish failed, record requeued",
                    );
                    (self.config.on_error)(&err);
                }
                Err(_) => {
                    record.requeue();
                    let err = anyhow::anyhow!(
                        "publish of record {} timed out after {:?}",
                        record.id(),
                        self.config.publish_timeout,
                    );
                    warn!(error = %err, "publish timed out, record requeued");
                    (self.config.on_error)(&err);
                }
            }
        }

        self.update_statuses(&records).await?;

        match marshal_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Persist final statuses grouped per status, one statement per group.
    /// Rows still in `progress` (after an aborted iteration) are left alone.
    async fn update_statuses(&self, records: &[Record]) -> Result<(), OutboxError> {
        let done: Vec<&Record> = records
            .iter()
            .filter(|record| record.status() == Some(Status::Done))
            .collect();
        let failed: Vec<&Record> = records
            .iter()
            .filter(|record| record.status() == Some(Status::Failed))
            .collect();
        let requeued: Vec<&Record> = records
            .iter()
            .filter(|record| record.status().is_none())
            .collect();

        self.storage.update(&done).await?;
        self.storage.update(&failed).await?;
        self.storage.update(&requeued).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    #[derive(Default)]
    struct StubBroker {
        calls: Mutex<Vec<(String, Vec<u8>)>>,
        failures_left: AtomicUsize,
        delay: Option<Duration>,
    }

    impl StubBroker {
        fn failing_first(failures: usize) -> Self {
            let broker = Self::default();
            broker.failures_left.store(failures, Ordering::SeqCst);
            broker
        }

        fn calls(&self) -> Vec<(String, Vec<u8>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Broker for StubBroker {
        async fn publish(&self, subject: &str, payload: &[u8]) -> anyhow::Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                anyhow::bail!("broker unavailable");
            }

            self.calls
                .lock()
                .unwrap()
                .push((subject.to_string(), payload.to_vec()));

            Ok(())
        }
    }

    fn counting_errors() -> (Arc<AtomicUsize>, Config) {
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);

        let config = Config::default().on_error(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        (errors, config)
    }

    async fn worker(pool: &PgPool, broker: Arc<StubBroker>, config: Config) -> Worker {
        let storage = Arc::new(Storage::new(pool.clone()));
        storage.init().await.unwrap();

        Worker {
            broker,
            storage,
            config,
        }
    }

    async fn status_of(pool: &PgPool, id: Uuid) -> Option<String> {
        sqlx::query_scalar("select status from __outbox_table where id = $1;")
            .bind(id.to_string())
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[sqlx::test]
    async fn iteration_publishes_and_finalizes_a_record(pool: PgPool) {
        let broker = Arc::new(StubBroker::default());
        let worker = worker(&pool, Arc::clone(&broker), Config::default()).await;

        let record = Record::new(Uuid::new_v4(), "order.created", json!({"n": 1})).unwrap();
        worker.storage.insert(&pool, &record).await.unwrap();

        worker.iteration().await.unwrap();

        assert_eq!(status_of(&pool, record.id()).await.as_deref(), Some("done"));

        let calls = broker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "order.created");
        assert_eq!(calls[0].1, serde_json::to_vec(&json!({"n": 1})).unwrap());
    }

    #[sqlx::test]
    async fn transient_broker_failure_requeues_then_succeeds(pool: PgPool) {
        let broker = Arc::new(StubBroker::failing_first(1));
        let (errors, config) = counting_errors();
        let worker = worker(&pool, Arc::clone(&broker), config).await;

        let record = Record::new(Uuid::new_v4(), "order.created", json!({})).unwrap();
        worker.storage.insert(&pool, &record).await.unwrap();

        // First attempt fails and clears the status for the next tick.
        worker.iteration().await.unwrap();
        assert_eq!(status_of(&pool, record.id()).await, None);
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        // Second attempt goes through.
        worker.iteration().await.unwrap();
        assert_eq!(status_of(&pool, record.id()).await.as_deref(), Some("done"));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(broker.calls().len(), 1);
    }

    #[sqlx::test]
    async fn slow_publish_hits_the_timeout_and_requeues(pool: PgPool) {
        let broker = Arc::new(StubBroker {
            delay: Some(Duration::from_millis(200)),
            ..StubBroker::default()
        });
        let (errors, config) = counting_errors();
        let config = config.with_publish_timeout(Duration::from_millis(20));
        let worker = worker(&pool, Arc::clone(&broker), config).await;

        let record = Record::new(Uuid::new_v4(), "order.created", json!({})).unwrap();
        worker.storage.insert(&pool, &record).await.unwrap();

        worker.iteration().await.unwrap();

        assert_eq!(status_of(&pool, record.id()).await, None);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(broker.calls().is_empty());
    }

    #[sqlx::test]
    async fn iteration_is_a_no_op_without_eligible_rows(pool: PgPool) {
        let broker = Arc::new(StubBroker::default());
        let worker = worker(&pool, Arc::clone(&broker), Config::default()).await;

        worker.iteration().await.unwrap();

        assert!(broker.calls().is_empty());
    }

    #[sqlx::test]
    async fn started_engine_publishes_on_the_first_tick(pool: PgPool) {
        let broker = Arc::new(StubBroker::default());
        let outbox = Outbox::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            pool.clone(),
            Config::default(),
        );

        outbox.storage.init().await.unwrap();

        let record = Record::new(Uuid::new_v4(), "order.created", json!({})).unwrap();
        outbox.writer().write_record(&pool, &record).await.unwrap();

        outbox.start().await.unwrap();

        let mut published = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;

            if status_of(&pool, record.id()).await.as_deref() == Some("done") {
                published = true;
                break;
            }
        }

        outbox.stop();

        assert!(published);
        assert_eq!(broker.calls().len(), 1);
    }
}
