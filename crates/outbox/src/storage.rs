//! SQL operations on the outbox table
//!
//! The claim statement flips every eligible row to `progress` in a single
//! `UPDATE … RETURNING`, which is what serializes competing workers.

use std::time::Instant;

use chrono::NaiveDateTime;
use sqlx::{FromRow, PgExecutor, PgPool};
use uuid::Uuid;

use relaybox_migration::Runner;

use crate::OutboxError;
use crate::migrations;
use crate::record::{Record, Status};

pub(crate) const TABLE_NAME: &str = "__outbox_table";

const FETCH_SQL: &str = r"
    update __outbox_table
    set status = $1,
        updated_at = (now() at time zone 'utc')
    where status is null
    returning id, status, event_type, payload, created_at;
";

const UPDATE_SQL: &str = r"
    update __outbox_table
    set status = $1,
        updated_at = (now() at time zone 'utc')
    where id = any($2);
";

const INSERT_SQL: &str = r"
    insert into __outbox_table (id, event_type, payload)
    values ($1, $2, $3)
    on conflict do nothing;
";

#[derive(Debug, FromRow)]
struct RecordRow {
    id: String,
    status: Option<String>,
    event_type: String,
    payload: serde_json::Value,
    created_at: NaiveDateTime,
}

pub(crate) struct Storage {
    pool: PgPool,
    runner: Runner,
}

impl Storage {
    pub(crate) fn new(pool: PgPool) -> Self {
        let runner = Runner::new(pool.clone(), migrations::STATE_TABLE, migrations::steps());

        Self { pool, runner }
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Bootstrap the outbox schema. Runs at most once per storage instance.
    pub(crate) async fn init(&self) -> Result<(), OutboxError> {
        self.runner.run_once().await.map_err(Into::into)
    }

    /// Claim every unsent row and return the batch ordered by `created_at`.
    pub(crate) async fn fetch(&self) -> Result<Vec<Record>, OutboxError> {
        let started = Instant::now();

        let result = sqlx::query_as::<_, RecordRow>(FETCH_SQL)
            .bind(Status::Progress.as_str())
            .fetch_all(&self.pool)
            .await;

        relaybox_metrics::observe(FETCH_SQL, started, result.is_ok());

        let mut rows = result?;
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        rows.into_iter().map(make_record).collect()
    }

    /// Write the shared status of `records` in a single statement.
    ///
    /// All records must carry the same status; `None` writes SQL NULL and
    /// makes the rows eligible again.
    pub(crate) async fn update(&self, records: &[&Record]) -> Result<(), OutboxError> {
        let Some(first) = records.first() else {
            return Ok(());
        };

        let status = first.status().map(Status::as_str);
        let ids: Vec<String> = records.iter().map(|record| record.id().to_string()).collect();

        let started = Instant::now();

        let result = sqlx::query(UPDATE_SQL)
            .bind(status)
            .bind(&ids)
            .execute(&self.pool)
            .await;

        relaybox_metrics::observe(UPDATE_SQL, started, result.is_ok());

        result?;

        Ok(())
    }

    /// Insert a record through the supplied executor.
    ///
    /// Passing the caller's open transaction makes the insert commit
    /// together with the business write. Duplicate ids are ignored.
    pub(crate) async fn insert<'e, E>(&self, executor: E, record: &Record) -> Result<(), OutboxError>
    where
        E: PgExecutor<'e>,
    {
        let started = Instant::now();

        let result = sqlx::query(INSERT_SQL)
            .bind(record.id().to_string())
            .bind(record.event_type())
            .bind(record.payload())
            .execute(executor)
            .await;

        relaybox_metrics::observe(INSERT_SQL, started, result.is_ok());

        result?;

        Ok(())
    }
}

fn make_record(row: RecordRow) -> Result<Record, OutboxError> {
    let id = Uuid::parse_str(&row.id)
        .map_err(|err| OutboxError::InvalidRecord(format!("bad record id {}: {err}", row.id)))?;

    let status = match row.status.as_deref() {
        None => None,
        Some(value) => Some(Status::parse(value).ok_or_else(|| {
            OutboxError::InvalidRecord(format!("unknown record status {value}"))
        })?),
    };

    Ok(Record::restore(id, status, row.event_type, row.payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn insert_with_created_at(pool: &PgPool, record: &Record, created_at: &str) {
        sqlx::query(
            "insert into __outbox_table (id, event_type, payload, created_at) \
             values ($1, $2, $3, $4::timestamp);",
        )
        .bind(record.id().to_string())
        .bind(record.event_type())
        .bind(record.payload())
        .bind(created_at)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn status_of(pool: &PgPool, id: Uuid) -> Option<String> {
        sqlx::query_scalar("select status from __outbox_table where id = $1;")
            .bind(id.to_string())
            .fetch_one(pool)
            .await
            .unwrap()
    }

    fn record(event_type: &str) -> Record {
        Record::new(Uuid::new_v4(), event_type, json!({"n": 1})).unwrap()
    }

    #[sqlx::test]
    async fn insert_ignores_a_duplicate_id(pool: PgPool) {
        let storage = Storage::new(pool.clone());
        storage.init().await.unwrap();

        let record = record("order.created");

        storage.insert(&pool, &record).await.unwrap();
        storage.insert(&pool, &record).await.unwrap();

        let count: i64 = sqlx::query_scalar("select count(*) from __outbox_table;")
            .fetch_one(&pool)
            .await
            .unwrap();

        assert_eq!(count, 1);
    }

    #[sqlx::test]
    async fn fetch_claims_unsent_rows_in_creation_order(pool: PgPool) {
        let storage = Storage::new(pool.clone());
        storage.init().await.unwrap();

        let newer = record("order.created");
        let older = record("order.created");

        insert_with_created_at(&pool, &newer, "2024-05-02 10:00:00").await;
        insert_with_created_at(&pool, &older, "2024-05-01 10:00:00").await;

        let batch = storage.fetch().await.unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id(), older.id());
        assert_eq!(batch[1].id(), newer.id());

        for claimed in &batch {
            assert_eq!(claimed.status(), Some(Status::Progress));
            assert_eq!(status_of(&pool, claimed.id()).await.as_deref(), Some("progress"));
        }
    }

    #[sqlx::test]
    async fn fetch_returns_an_empty_batch_when_nothing_is_eligible(pool: PgPool) {
        let storage = Storage::new(pool.clone());
        storage.init().await.unwrap();

        let batch = storage.fetch().await.unwrap();
        assert!(batch.is_empty());

        // Claimed and finished rows are not eligible either.
        storage.insert(&pool, &record("order.created")).await.unwrap();
        storage.fetch().await.unwrap();

        let batch = storage.fetch().await.unwrap();
        assert!(batch.is_empty());
    }

    #[sqlx::test]
    async fn update_writes_the_group_status(pool: PgPool) {
        let storage = Storage::new(pool.clone());
        storage.init().await.unwrap();

        storage.insert(&pool, &record("order.created")).await.unwrap();
        storage.insert(&pool, &record("order.created")).await.unwrap();

        let mut batch = storage.fetch().await.unwrap();
        for claimed in &mut batch {
            claimed.done();
        }

        let group: Vec<&Record> = batch.iter().collect();
        storage.update(&group).await.unwrap();

        for claimed in &batch {
            assert_eq!(status_of(&pool, claimed.id()).await.as_deref(), Some("done"));
        }
    }

    #[sqlx::test]
    async fn update_with_no_status_requeues_the_rows(pool: PgPool) {
        let storage = Storage::new(pool.clone());
        storage.init().await.unwrap();

        storage.insert(&pool, &record("order.created")).await.unwrap();

        let mut batch = storage.fetch().await.unwrap();
        batch[0].requeue();

        let group: Vec<&Record> = batch.iter().collect();
        storage.update(&group).await.unwrap();

        assert_eq!(status_of(&pool, batch[0].id()).await, None);

        // The row is eligible again.
        let batch = storage.fetch().await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[sqlx::test]
    async fn done_rows_are_never_reclaimed(pool: PgPool) {
        let storage = Storage::new(pool.clone());
        storage.init().await.unwrap();

        storage.insert(&pool, &record("order.created")).await.unwrap();

        let mut batch = storage.fetch().await.unwrap();
        batch[0].done();

        let group: Vec<&Record> = batch.iter().collect();
        storage.update(&group).await.unwrap();

        assert!(storage.fetch().await.unwrap().is_empty());
    }
}
