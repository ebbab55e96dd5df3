use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;

use crate::config::QueueConfig;
use crate::error::{ConfigurationError, QueueError, StorageError};
use crate::gateway::RetryPolicy;
use crate::schema::Statements;
use crate::store::JobStore;
use crate::types::{FetchedJob, JobRecord, JobStatus, NewJob};

/// Postgres caps a statement at this many bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

/// Columns bound per row before the extra fields.
const BASE_INSERT_COLUMNS: usize = 5;

/// A [`JobStore`] backed by a PostgreSQL table.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
    statements: Statements,
    extra_fields: Vec<String>,
    retry: RetryPolicy,
}

impl PgJobStore {
    /// Opens a pool to `config.database_url`.
    pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let url = config
            .database_url
            .as_deref()
            .ok_or(ConfigurationError::MissingConnection)?;

        let pool = config
            .retry
            .run("connect", move || async move {
                PgPoolOptions::new().connect(url).await
            })
            .await?;

        Ok(Self::new(pool, config)?)
    }

    /// Wraps an existing pool. The table is not created.
    pub fn new(pool: PgPool, config: &QueueConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            pool,
            statements: Statements::new(&config.table, &config.extra_fields),
            extra_fields: config.extra_fields.clone(),
            retry: config.retry.clone(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn record_from_row(&self, row: &PgRow) -> Result<JobRecord, StorageError> {
        let status: String = row.try_get("status")?;
        let mut extra = BTreeMap::new();
        for field in &self.extra_fields {
            let value: Option<String> = row.try_get(field.as_str())?;
            extra.insert(field.clone(), value);
        }

        Ok(JobRecord {
            id: row.try_get("id")?,
            batch_id: row.try_get("batch_id")?,
            job_type: row.try_get("job_type")?,
            created_ts: row.try_get("created_ts")?,
            started_ts: row.try_get("started_ts")?,
            body: row.try_get("body")?,
            status: status.parse::<JobStatus>()?,
            result: row.try_get("result")?,
            recovered: row.try_get("recovered")?,
            running_time: row.try_get("running_time")?,
            unique_key: row.try_get("unique_key")?,
            priority: row.try_get("priority")?,
            extra,
        })
    }

    async fn record_outcome(
        &self,
        sql: &str,
        id: i64,
        batch_id: i64,
        result: &str,
    ) -> Result<bool, StorageError> {
        let pool = &self.pool;
        self.retry
            .run("record_outcome", move || async move {
                sqlx::query(sql)
                    .bind(result)
                    .bind(id)
                    .bind(batch_id)
                    .execute(pool)
                    .await
                    .map(|done| done.rows_affected() > 0)
            })
            .await
    }

    async fn sweep(
        &self,
        sql: &str,
        job_type: &str,
        older_than: Duration,
    ) -> Result<u64, StorageError> {
        let pool = &self.pool;
        let seconds = older_than.as_secs_f64();
        self.retry
            .run("sweep", move || async move {
                sqlx::query(sql)
                    .bind(seconds)
                    .bind(job_type)
                    .execute(pool)
                    .await
                    .map(|done| done.rows_affected())
            })
            .await
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip_all, err)]
    async fn create_table(&self) -> Result<(), StorageError> {
        let pool = &self.pool;
        for sql in &self.statements.create {
            let sql = sql.as_str();
            self.retry
                .run("create_table", move || async move {
                    sqlx::query(sql).execute(pool).await
                })
                .await?;
        }
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn drop_table(&self) -> Result<(), StorageError> {
        let pool = &self.pool;
        let sql = self.statements.drop.as_str();
        self.retry
            .run("drop_table", move || async move {
                sqlx::query(sql).execute(pool).await
            })
            .await?;
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn select_all(&self) -> Result<Vec<JobRecord>, StorageError> {
        let pool = &self.pool;
        let sql = self.statements.select_all.as_str();
        let rows = self
            .retry
            .run("select_all", move || async move {
                sqlx::query(sql).fetch_all(pool).await
            })
            .await?;

        rows.iter().map(|row| self.record_from_row(row)).collect()
    }

    #[instrument(skip_all, err, fields(count = jobs.len()))]
    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<u64, StorageError> {
        let pool = &self.pool;
        let statements = &self.statements;
        let rows_per_statement = MAX_BIND_PARAMS / (BASE_INSERT_COLUMNS + self.extra_fields.len());

        let mut written = 0;
        for chunk in jobs.chunks(rows_per_statement.max(1)) {
            written += self
                .retry
                .run("insert_jobs", move || async move {
                    let mut builder =
                        QueryBuilder::<Postgres>::new(statements.insert_prefix.as_str());
                    builder.push_values(chunk, |mut row, job| {
                        row.push_bind(job.body.as_str())
                            .push_bind(job.job_type.as_str())
                            .push_bind(job.unique_key)
                            .push_bind(job.priority)
                            .push_bind(job.created_ts);
                        for (_, value) in &job.extra {
                            row.push_bind(value.as_deref());
                        }
                    });
                    builder.push(statements.upsert_suffix.as_str());
                    builder
                        .build()
                        .execute(pool)
                        .await
                        .map(|done| done.rows_affected())
                })
                .await?;
        }
        Ok(written)
    }

    #[instrument(skip_all, err, fields(job_type = %job_type, batch_id = batch_id))]
    async fn reserve_batch(
        &self,
        job_type: &str,
        batch_id: i64,
        limit: usize,
    ) -> Result<u64, StorageError> {
        let pool = &self.pool;
        let sql = self.statements.reserve.as_str();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.retry
            .run("reserve_batch", move || async move {
                sqlx::query(sql)
                    .bind(batch_id)
                    .bind(job_type)
                    .bind(limit)
                    .execute(pool)
                    .await
                    .map(|done| done.rows_affected())
            })
            .await
    }

    #[instrument(skip_all, err, fields(batch_id = batch_id))]
    async fn fetch_batch(
        &self,
        batch_id: i64,
        limit: usize,
    ) -> Result<Vec<FetchedJob>, StorageError> {
        let pool = &self.pool;
        let sql = self.statements.fetch.as_str();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.retry
            .run("fetch_batch", move || async move {
                let rows = sqlx::query(sql)
                    .bind(batch_id)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?;
                rows.iter()
                    .map(|row| {
                        Ok(FetchedJob {
                            id: row.try_get("id")?,
                            body: row.try_get("body")?,
                        })
                    })
                    .collect::<Result<Vec<_>, sqlx::Error>>()
            })
            .await
    }

    #[instrument(skip_all, err, fields(id = id, batch_id = batch_id))]
    async fn complete_job(
        &self,
        id: i64,
        batch_id: i64,
        result: &str,
    ) -> Result<bool, StorageError> {
        self.record_outcome(&self.statements.complete, id, batch_id, result)
            .await
    }

    #[instrument(skip_all, err, fields(id = id, batch_id = batch_id))]
    async fn fail_job(&self, id: i64, batch_id: i64, detail: &str) -> Result<bool, StorageError> {
        self.record_outcome(&self.statements.fail, id, batch_id, detail)
            .await
    }

    #[instrument(skip_all, err, fields(job_type = %job_type))]
    async fn recover_stuck(
        &self,
        job_type: &str,
        older_than: Duration,
    ) -> Result<u64, StorageError> {
        self.sweep(&self.statements.recover, job_type, older_than)
            .await
    }

    #[instrument(skip_all, err, fields(job_type = %job_type))]
    async fn mark_stuck(&self, job_type: &str, older_than: Duration) -> Result<u64, StorageError> {
        self.sweep(&self.statements.mark_stuck, job_type, older_than)
            .await
    }
}
