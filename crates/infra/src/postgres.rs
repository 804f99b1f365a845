//! Postgres-backed job store.
//!
//! Everything the claim protocol needs comes from ordinary single-row
//! `UPDATE ... WHERE status = ANY(...)` statements: Postgres serializes
//! writers on the row, so `rows_affected` tells us whether we won. No
//! advisory locks, no `FOR UPDATE`.
//!
//! `idempotency_key` carries a unique constraint; a `23505` on insert is the
//! duplicate-submission signal, not a failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use ledgersync_core::JobId;
use ledgersync_queue::job::{Job, JobStatus, JobUpdate, NewJob};
use ledgersync_queue::store::{JobStore, JobStoreError, STUCK_JOB_ERROR};

const SELECT_COLUMNS: &str = "id, idempotency_key, group_id, job_type, target, payload, priority, \
     status, attempts, max_attempts, scheduled_for, next_retry_at, last_error, response, \
     created_at, started_at, completed_at, updated_at";

/// Job store over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Connect and bootstrap the schema.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create the `jobs` table and its indexes if absent. Idempotent.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                idempotency_key TEXT NOT NULL UNIQUE,
                group_id TEXT,
                job_type TEXT NOT NULL,
                target JSONB NOT NULL,
                payload JSONB NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                scheduled_for TIMESTAMPTZ NOT NULL,
                next_retry_at TIMESTAMPTZ,
                last_error TEXT,
                response JSONB,
                created_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_claimable \
             ON jobs (status, priority, created_at) \
             WHERE status IN ('pending', 'failed')",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_group \
             ON jobs (group_id) WHERE group_id IS NOT NULL",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        info!("job schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Raw row shape; status is parsed into [`JobStatus`] on conversion.
#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    idempotency_key: String,
    group_id: Option<String>,
    job_type: String,
    target: serde_json::Value,
    payload: serde_json::Value,
    priority: i32,
    status: String,
    attempts: i32,
    max_attempts: i32,
    scheduled_for: DateTime<Utc>,
    next_retry_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    response: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn into_job(self) -> Result<Job, JobStoreError> {
        let status = JobStatus::parse(&self.status)
            .map_err(|e| JobStoreError::Storage(format!("corrupt status column: {e}")))?;
        Ok(Job {
            id: JobId::from_uuid(self.id),
            idempotency_key: self.idempotency_key,
            group_id: self.group_id,
            job_type: self.job_type,
            target: self.target,
            payload: self.payload,
            priority: self.priority,
            status,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            scheduled_for: self.scheduled_for,
            next_retry_at: self.next_retry_at,
            last_error: self.last_error,
            response: self.response,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, new_job: NewJob) -> Result<Job, JobStoreError> {
        let job = new_job.into_job();
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, idempotency_key, group_id, job_type, target, payload, priority,
                status, attempts, max_attempts, scheduled_for, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.idempotency_key)
        .bind(&job.group_id)
        .bind(&job.job_type)
        .bind(&job.target)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.scheduled_for)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(job_id = %job.id, "job row inserted");
                Ok(job)
            }
            Err(e) if is_unique_violation(&e) => {
                Err(JobStoreError::DuplicateKey(job.idempotency_key))
            }
            Err(e) => Err(map_sqlx_error("insert", e)),
        }
    }

    async fn find(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("find", e))?;
        row.map(JobRow::into_job).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobStoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM jobs WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;
        row.map(JobRow::into_job).transpose()
    }

    async fn select_eligible(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM jobs \
             WHERE status IN ('pending', 'failed') \
               AND scheduled_for <= NOW() \
               AND (next_retry_at IS NULL OR next_retry_at <= NOW()) \
             ORDER BY priority ASC, created_at ASC \
             LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_eligible", e))?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn conditional_update(
        &self,
        id: JobId,
        expected: &[JobStatus],
        changes: JobUpdate,
    ) -> Result<bool, JobStoreError> {
        let expected: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();

        // One predicated write. Boolean flags select which columns the
        // change set touches; untouched columns keep their value, and a
        // touched Option sets NULL. The final CASE mirrors
        // `JobStatus::can_transition_to`: a requested status change that is
        // not a legal edge never applies, whatever the caller's predicate.
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = COALESCE($3::text, status),
                attempts = CASE
                    WHEN $4 THEN attempts + 1
                    WHEN $5::int4 IS NOT NULL THEN $5::int4
                    ELSE attempts
                END,
                started_at = COALESCE($6::timestamptz, started_at),
                completed_at = COALESCE($7::timestamptz, completed_at),
                next_retry_at = CASE WHEN $8 THEN $9::timestamptz ELSE next_retry_at END,
                last_error = CASE WHEN $10 THEN $11::text ELSE last_error END,
                response = CASE WHEN $12 THEN $13::jsonb ELSE response END,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
              AND ($3::text IS NULL OR CASE $3::text
                    WHEN 'processing' THEN status IN ('pending', 'failed')
                    WHEN 'completed' THEN status = 'processing'
                    WHEN 'failed' THEN status = 'processing'
                    WHEN 'dead' THEN status IN ('processing', 'failed')
                    WHEN 'pending' THEN status = 'dead'
                    ELSE FALSE
                  END)
            "#,
        )
        .bind(id.as_uuid())
        .bind(&expected)
        .bind(changes.status.map(|s| s.as_str()))
        .bind(changes.bump_attempts)
        .bind(changes.set_attempts)
        .bind(changes.started_at)
        .bind(changes.completed_at)
        .bind(changes.next_retry_at.is_some())
        .bind(changes.next_retry_at.flatten())
        .bind(changes.last_error.is_some())
        .bind(changes.last_error.clone().flatten())
        .bind(changes.response.is_some())
        .bind(changes.response.clone().flatten())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("conditional_update", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, JobStoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut counts = HashMap::new();
        for (status, count) in rows {
            let status = JobStatus::parse(&status)
                .map_err(|e| JobStoreError::Storage(format!("corrupt status column: {e}")))?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }

    async fn count_non_terminal_in_group(&self, group_id: &str) -> Result<u64, JobStoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs \
             WHERE group_id = $1 AND status NOT IN ('completed', 'dead')",
        )
        .bind(group_id)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_non_terminal_in_group", e))?;
        Ok(count as u64)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM jobs \
             WHERE status = 'dead' \
             ORDER BY updated_at DESC \
             LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn reset_all_dead(&self) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET \
                 status = 'pending', \
                 attempts = 0, \
                 last_error = NULL, \
                 next_retry_at = NULL, \
                 updated_at = NOW() \
             WHERE status = 'dead'",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_all_dead", e))?;
        Ok(result.rows_affected())
    }

    async fn recover_stuck(&self, stuck_threshold: Duration) -> Result<u64, JobStoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stuck_threshold)
                .map_err(|e| JobStoreError::Storage(format!("invalid stuck threshold: {e}")))?;

        // Bulk predicated update: rows claimed by a worker that never
        // settled them. Immediately eligible again (next_retry_at = NOW()).
        let result = sqlx::query(
            "UPDATE jobs SET \
                 status = 'failed', \
                 next_retry_at = NOW(), \
                 last_error = $2, \
                 updated_at = NOW() \
             WHERE status = 'processing' AND started_at < $1",
        )
        .bind(cutoff)
        .bind(STUCK_JOB_ERROR)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_stuck", e))?;
        Ok(result.rows_affected())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505")
    )
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
