//! Versioned schema bootstrap
//!
//! A small migration runner used by the inbox and outbox storages to create
//! their tables. Each storage carries an embedded bundle of ordered steps and
//! its own state table (`inbox_schema` / `outbox_schema`), so the two boxes
//! can migrate independently against the same database.

use std::collections::HashSet;

use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Errors produced by the migration runner.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A previous [`Runner::run_once`] failed; the runner will not
    /// re-attempt the bundle. Carries the original failure.
    #[error("migration already failed: {0}")]
    AlreadyFailed(String),
}

/// A single migration step with its rollback statement.
///
/// `up` and `down` may contain several `;`-separated statements.
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub version: i64,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

/// Applies a bundle of [`Step`]s, recording progress in a state table.
pub struct Runner {
    pool: PgPool,
    state_table: String,
    steps: Vec<Step>,
    init: OnceCell<Result<(), String>>,
}

impl Runner {
    pub fn new(pool: PgPool, state_table: impl Into<String>, mut steps: Vec<Step>) -> Self {
        steps.sort_by_key(|step| step.version);

        Self {
            pool,
            state_table: state_table.into(),
            steps,
            init: OnceCell::new(),
        }
    }

    /// Apply pending steps once for the lifetime of this runner.
    ///
    /// Concurrent callers share a single execution. If `up` fails, a
    /// best-effort `down` reverts whatever was applied and the failure is
    /// terminal: the caller that ran the bundle receives the original error,
    /// every later call gets [`MigrationError::AlreadyFailed`] without the
    /// bundle being re-attempted.
    pub async fn run_once(&self) -> Result<(), MigrationError> {
        let mut first_error = None;

        let outcome = self
            .init
            .get_or_init(|| async {
                match self.up().await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        if let Err(down_err) = self.down().await {
                            warn!(
                                state_table = %self.state_table,
                                error = %down_err,
                                "rollback after failed migration also failed",
                            );
                        }

                        let message = err.to_string();
                        first_error = Some(err);

                        Err(message)
                    }
                }
            })
            .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(message) => match first_error.take() {
                Some(err) => Err(err),
                None => Err(MigrationError::AlreadyFailed(message.clone())),
            },
        }
    }

    /// Apply all steps that are not recorded in the state table yet, in
    /// ascending version order.
    pub async fn up(&self) -> Result<(), MigrationError> {
        self.ensure_state_table().await?;

        let applied = self.applied_versions().await?;

        for step in &self.steps {
            if applied.contains(&step.version) {
                continue;
            }

            let mut tx: sqlx::Transaction<'_, sqlx::Postgres> = self.pool.begin().await?;

            sqlx::raw_sql(step.up).execute(&mut *tx).await?;

            let record = format!(
                "insert into {} (version, name) values ($1, $2);",
                self.state_table,
            );
            sqlx::query(&record)
                .bind(step.version)
                .bind(step.name)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            info!(
                state_table = %self.state_table,
                version = step.version,
                name = step.name,
                "applied migration step",
            );
        }

        Ok(())
    }

    /// Revert all applied steps in descending version order.
    pub async fn down(&self) -> Result<(), MigrationError> {
        self.ensure_state_table().await?;

        let applied = self.applied_versions().await?;

        for step in self.steps.iter().rev() {
            if !applied.contains(&step.version) {
                continue;
            }

            let mut tx: sqlx::Transaction<'_, sqlx::Postgres> = self.pool.begin().await?;

            sqlx::raw_sql(step.down).execute(&mut *tx).await?;

            let record = format!("delete from {} where version = $1;", self.state_table);
            sqlx::query(&record)
                .bind(step.version)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            info!(
                state_table = %self.state_table,
                version = step.version,
                name = step.name,
                "reverted migration step",
            );
        }

        Ok(())
    }

    async fn ensure_state_table(&self) -> Result<(), MigrationError> {
        let ddl = format!(
            "create table if not exists {} ( \
                version bigint primary key, \
                name text not null, \
                applied_at timestamp not null default (now() at time zone 'utc') \
            );",
            self.state_table,
        );

        sqlx::query(&ddl).execute(&self.pool).await?;

        Ok(())
    }

    async fn applied_versions(&self) -> Result<HashSet<i64>, MigrationError> {
        let query = format!("select version from {};", self.state_table);

        let versions: Vec<i64> = sqlx::query_scalar(&query).fetch_all(&self.pool).await?;

        Ok(versions.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    const STATE_TABLE: &str = "test_schema";

    fn bundle() -> Vec<Step> {
        vec![
            Step {
                version: 1,
                name: "create_widgets",
                up: "create table if not exists test_widgets (id bigint primary key);",
                down: "drop table if exists test_widgets;",
            },
            Step {
                version: 2,
                name: "add_label",
                up: "alter table test_widgets add column if not exists label text;",
                down: "alter table test_widgets drop column if exists label;",
            },
        ]
    }

    async fn applied_count(pool: &PgPool) -> i64 {
        sqlx::query_scalar(&format!("select count(*) from {STATE_TABLE};"))
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[sqlx::test]
    async fn up_applies_all_steps_in_order(pool: PgPool) {
        let runner = Runner::new(pool.clone(), STATE_TABLE, bundle());

        runner.up().await.unwrap();

        assert_eq!(applied_count(&pool).await, 2);

        // Both steps must be live: the column from step 2 is insertable.
        sqlx::query("insert into test_widgets (id, label) values (1, 'a');")
            .execute(&pool)
            .await
            .unwrap();
    }

    #[sqlx::test]
    async fn up_is_idempotent(pool: PgPool) {
        let runner = Runner::new(pool.clone(), STATE_TABLE, bundle());

        runner.up().await.unwrap();
        runner.up().await.unwrap();

        assert_eq!(applied_count(&pool).await, 2);
    }

    #[sqlx::test]
    async fn down_reverts_applied_steps(pool: PgPool) {
        let runner = Runner::new(pool.clone(), STATE_TABLE, bundle());

        runner.up().await.unwrap();
        runner.down().await.unwrap();

        assert_eq!(applied_count(&pool).await, 0);

        let exists: bool = sqlx::query_scalar(
            "select exists (select from information_schema.tables where table_name = 'test_widgets');",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert!(!exists);
    }

    #[sqlx::test]
    async fn run_once_runs_a_single_time(pool: PgPool) {
        let runner = Runner::new(pool.clone(), STATE_TABLE, bundle());

        runner.run_once().await.unwrap();
        runner.run_once().await.unwrap();

        assert_eq!(applied_count(&pool).await, 2);
    }

    #[sqlx::test]
    async fn run_once_executes_up_once_across_concurrent_callers(pool: PgPool) {
        let runner = Arc::new(Runner::new(pool.clone(), STATE_TABLE, bundle()));

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let runner = Arc::clone(&runner);

                tokio::spawn(async move { runner.run_once().await })
            })
            .collect();

        for caller in callers {
            caller.await.unwrap().unwrap();
        }

        assert_eq!(applied_count(&pool).await, 2);
    }

    #[sqlx::test]
    async fn failed_up_rolls_the_bundle_back(pool: PgPool) {
        let mut steps = bundle();
        steps.push(Step {
            version: 3,
            name: "broken",
            up: "this is not sql;",
            down: "select 1;",
        });

        let runner = Runner::new(pool.clone(), STATE_TABLE, steps);

        assert!(matches!(
            runner.run_once().await,
            Err(MigrationError::Database(_)),
        ));

        // The best-effort rollback removed the successfully applied steps.
        assert_eq!(applied_count(&pool).await, 0);

        // The failure is terminal: the bundle is not re-attempted.
        assert!(matches!(
            runner.run_once().await,
            Err(MigrationError::AlreadyFailed(_)),
        ));
        assert_eq!(applied_count(&pool).await, 0);
    }
}
