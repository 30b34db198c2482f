//! SQL operations on the inbox table
//!
//! Eligibility lives entirely in the claim statement: unprocessed rows are
//! taken unconditionally, failed rows only once their retry deadline has
//! passed. `done` and `dead` rows are never touched again.

use std::time::Instant;

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use relaybox_migration::Runner;

use crate::InboxError;
use crate::migrations;
use crate::record::{Record, Status};

pub(crate) const TABLE_NAME: &str = "__inbox_table";

const FETCH_SQL: &str = r"
    update __inbox_table
    set status = $1,
        updated_at = (now() at time zone 'utc')
    where status is null
       or (status = 'failed' and next_attempt <= $2)
    returning id, status, event_type, handler_key, payload,
              attempt, error_message, next_attempt, created_at;
";

const UPDATE_SQL: &str = r"
    update __inbox_table
    set status = $1,
        attempt = $2,
        error_message = $3,
        next_attempt = $4,
        updated_at = (now() at time zone 'utc')
    where id = $5 and handler_key = $6;
";

const INSERT_SQL: &str = r"
    insert into __inbox_table (id, event_type, handler_key, payload)
    values ($1, $2, $3, $4)
    on conflict (id, handler_key) do nothing;
";

#[derive(Debug, FromRow)]
struct RecordRow {
    id: String,
    status: Option<String>,
    event_type: String,
    handler_key: String,
    payload: Vec<u8>,
    attempt: i32,
    error_message: Option<String>,
    next_attempt: Option<NaiveDateTime>,
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

    /// Bootstrap the inbox schema. Runs at most once per storage instance.
    pub(crate) async fn init(&self) -> Result<(), InboxError> {
        self.runner.run_once().await.map_err(Into::into)
    }

    /// Claim every row eligible at `now` and return the batch ordered by
    /// `created_at`.
    pub(crate) async fn fetch(&self, now: DateTime<Utc>) -> Result<Vec<Record>, InboxError> {
        let started = Instant::now();

        let result = sqlx::query_as::<_, RecordRow>(FETCH_SQL)
            .bind(Status::Progress.as_str())
            .bind(now.naive_utc())
            .fetch_all(&self.pool)
            .await;

        relaybox_metrics::observe(FETCH_SQL, started, result.is_ok());

        let mut rows = result?;
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        rows.into_iter().map(make_record).collect()
    }

    /// Persist the state of every record, one statement per record.
    pub(crate) async fn update(&self, records: &[Record]) -> Result<(), InboxError> {
        for record in records {
            let started = Instant::now();

            let result = sqlx::query(UPDATE_SQL)
                .bind(record.status().map(Status::as_str))
                .bind(record.attempt())
                .bind(record.error_message())
                .bind(record.next_attempt().map(|at| at.naive_utc()))
                .bind(record.id().to_string())
                .bind(record.handler_key())
                .execute(&self.pool)
                .await;

            relaybox_metrics::observe(UPDATE_SQL, started, result.is_ok());

            result?;
        }

        Ok(())
    }

    /// Insert one fanned-out row. A duplicate `(id, handler_key)` pair is
    /// ignored, which makes redelivered broker messages a no-op.
    pub(crate) async fn insert(&self, record: &Record) -> Result<(), InboxError> {
        let started = Instant::now();

        let result = sqlx::query(INSERT_SQL)
            .bind(record.id().to_string())
            .bind(record.event_type())
            .bind(record.handler_key())
            .bind(record.payload())
            .execute(&self.pool)
            .await;

        relaybox_metrics::observe(INSERT_SQL, started, result.is_ok());

        result?;

        Ok(())
    }
}

fn make_record(row: RecordRow) -> Result<Record, InboxError> {
    let id = Uuid::parse_str(&row.id)
        .map_err(|err| InboxError::InvalidRecord(format!("bad record id {}: {err}", row.id)))?;

    let status = match row.status.as_deref() {
        None => None,
        Some(value) => Some(Status::parse(value).ok_or_else(|| {
            InboxError::InvalidRecord(format!("unknown record status {value}"))
        })?),
    };

    Ok(Record::restore(
        id,
        status,
        row.event_type,
        row.handler_key,
        row.payload,
        row.attempt,
        row.error_message,
        row.next_attempt.map(|at| at.and_utc()),
    ))
}
