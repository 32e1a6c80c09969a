//! Postgres-backed job store.
//!
//! The claim is a single `UPDATE … FROM (SELECT … FOR UPDATE SKIP LOCKED)`
//! statement run inside an explicit transaction. Rows locked by another
//! worker's in-flight claim are skipped rather than waited on, so concurrent
//! workers never receive overlapping batches and never serialize behind each
//! other.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database / PoolClosed / Io / other | `Storage` (operation name + message) |
//! | Row decode failure (`get`) | `Decode` |
//! | Row decode failure (`claim_batch`) | row dead-lettered, rest of batch returned |
//! | `UPDATE` touching 0 rows | `NotTransitioned` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{error, instrument, warn, Span};

use searchsync_core::{JobId, SubjectId};

use super::store::{JobStore, JobStoreError, STALE_PROCESSING_ERROR};
use super::types::{Job, JobAction, JobStatus};

const CREATE_JOBS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS search_index_jobs (
        id            UUID PRIMARY KEY,
        subject_id    UUID NOT NULL,
        action        TEXT NOT NULL CHECK (action IN ('index', 'delete')),
        status        TEXT NOT NULL DEFAULT 'pending'
                      CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'dead')),
        attempts      INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_attempts  INTEGER NOT NULL DEFAULT 5 CHECK (max_attempts >= 1),
        last_error    TEXT NULL,
        scheduled_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        processed_at  TIMESTAMPTZ NULL,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

const CREATE_CLAIM_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_search_index_jobs_claimable
        ON search_index_jobs (scheduled_at)
        WHERE status IN ('pending', 'failed')
"#;

// Only `status` and `updated_at` change on claim, so the previous values of
// those two come from the locking subquery and everything else from the row.
const CLAIM_BATCH: &str = r#"
    WITH claimable AS (
        SELECT id, status AS prev_status, updated_at AS prev_updated_at
        FROM search_index_jobs
        WHERE status IN ('pending', 'failed')
          AND scheduled_at <= NOW()
        ORDER BY scheduled_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    )
    UPDATE search_index_jobs j
    SET status = 'processing', updated_at = NOW()
    FROM claimable c
    WHERE j.id = c.id
    RETURNING j.id, j.subject_id, j.action, c.prev_status AS status,
              j.attempts, j.max_attempts, j.last_error, j.scheduled_at,
              j.processed_at, j.created_at, c.prev_updated_at AS updated_at
"#;

const MARK_COMPLETED: &str = r#"
    UPDATE search_index_jobs
    SET status = 'completed', processed_at = NOW(), updated_at = NOW()
    WHERE id = $1 AND status NOT IN ('completed', 'dead')
"#;

const MARK_FAILED: &str = r#"
    UPDATE search_index_jobs
    SET status = 'failed',
        attempts = attempts + 1,
        last_error = $2,
        scheduled_at = $3,
        updated_at = NOW()
    WHERE id = $1 AND status NOT IN ('completed', 'dead')
"#;

const MARK_DEAD: &str = r#"
    UPDATE search_index_jobs
    SET status = 'dead',
        attempts = attempts + 1,
        last_error = $2,
        updated_at = NOW()
    WHERE id = $1 AND status NOT IN ('completed', 'dead')
"#;

const MARK_UNDECODABLE: &str = r#"
    UPDATE search_index_jobs
    SET status = 'dead',
        attempts = attempts + 1,
        last_error = $2,
        updated_at = NOW()
    WHERE id = $1
"#;

/// Upper bound on the reclaim window handed to Postgres interval arithmetic
/// (100 years).
const MAX_STALE_AFTER_SECS: f64 = 100.0 * 365.0 * 24.0 * 3600.0;

// Right-hand `attempts` is the pre-update value.
const RECLAIM_STALE: &str = r#"
    UPDATE search_index_jobs
    SET attempts = attempts + 1,
        last_error = $2,
        status = CASE
            WHEN attempts + 1 >= GREATEST(LEAST(max_attempts, $3), 1) THEN 'dead'
            ELSE 'failed'
        END,
        scheduled_at = CASE
            WHEN attempts + 1 >= GREATEST(LEAST(max_attempts, $3), 1) THEN scheduled_at
            ELSE NOW()
        END,
        updated_at = NOW()
    WHERE status = 'processing'
      AND updated_at <= NOW() - make_interval(secs => $1)
"#;

const INSERT_JOB: &str = r#"
    INSERT INTO search_index_jobs
        (id, subject_id, action, status, attempts, max_attempts, last_error,
         scheduled_at, processed_at, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
"#;

const SELECT_JOB: &str = r#"
    SELECT id, subject_id, action, status, attempts, max_attempts, last_error,
           scheduled_at, processed_at, created_at, updated_at
    FROM search_index_jobs
    WHERE id = $1
"#;

/// Postgres-backed job store over `search_index_jobs`.
///
/// `Send + Sync`; cheap to clone (shares the pool).
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    /// Create a new PostgresJobStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the job table and its claim index if they don't exist.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::query(CREATE_JOBS_TABLE)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_jobs_table", e))?;
        sqlx::query(CREATE_CLAIM_INDEX)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_claim_index", e))?;
        Ok(())
    }

    /// Insert a job row as-is.
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    pub async fn insert(&self, job: &Job) -> Result<JobId, JobStoreError> {
        sqlx::query(INSERT_JOB)
            .bind(job.id.as_uuid())
            .bind(job.subject_id.as_uuid())
            .bind(job.action.as_str())
            .bind(job.status.as_str())
            .bind(i32::try_from(job.attempts).unwrap_or(i32::MAX))
            .bind(i32::try_from(job.max_attempts).unwrap_or(i32::MAX))
            .bind(job.last_error.as_deref())
            .bind(job.scheduled_at)
            .bind(job.processed_at)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(job.id)
    }

    /// Current state of a job.
    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(SELECT_JOB)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|row| JobRow::from_row(&row).and_then(Job::try_from))
            .transpose()
    }

    async fn execute_transition(
        &self,
        operation: &'static str,
        job_id: JobId,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), JobStoreError> {
        let result = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotTransitioned(job_id));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self),
        fields(claimed = tracing::field::Empty, undecodable = tracing::field::Empty),
        err
    )]
    async fn claim_batch(&self, batch_size: usize) -> Result<Vec<Job>, JobStoreError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let rows = sqlx::query(CLAIM_BATCH)
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        // A row this worker cannot read is dead-lettered in the same
        // transaction; the rest of the batch is still handed out.
        let mut jobs = Vec::with_capacity(rows.len());
        let mut undecodable = 0usize;
        for row in &rows {
            let error = match JobRow::from_row(row).and_then(Job::try_from) {
                Ok(job) => {
                    jobs.push(job);
                    continue;
                }
                Err(e) => e,
            };
            undecodable += 1;

            let id: Result<uuid::Uuid, _> = row.try_get("id");
            match id {
                Ok(id) => {
                    warn!(job_id = %id, error = %error, "dead-lettering undecodable job");
                    sqlx::query(MARK_UNDECODABLE)
                        .bind(id)
                        .bind(error.to_string())
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx_error("mark_undecodable", e))?;
                }
                Err(e) => error!(error = %e, "claimed job row has no readable id"),
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        // RETURNING order is unspecified.
        jobs.sort_by_key(|j| j.scheduled_at);

        let span = Span::current();
        span.record("claimed", jobs.len());
        span.record("undecodable", undecodable);
        Ok(jobs)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_completed(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let query = sqlx::query(MARK_COMPLETED).bind(job_id.as_uuid());
        self.execute_transition("mark_completed", job_id, query).await
    }

    #[instrument(skip(self, error), fields(job_id = %job_id), err)]
    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        next_schedule_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let query = sqlx::query(MARK_FAILED)
            .bind(job_id.as_uuid())
            .bind(error)
            .bind(next_schedule_at);
        self.execute_transition("mark_failed", job_id, query).await
    }

    #[instrument(skip(self, error), fields(job_id = %job_id), err)]
    async fn mark_dead(&self, job_id: JobId, error: &str) -> Result<(), JobStoreError> {
        let query = sqlx::query(MARK_DEAD).bind(job_id.as_uuid()).bind(error);
        self.execute_transition("mark_dead", job_id, query).await
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale(
        &self,
        stale_after: Duration,
        max_attempts: u32,
    ) -> Result<u64, JobStoreError> {
        let result = sqlx::query(RECLAIM_STALE)
            .bind(stale_after.as_secs_f64().min(MAX_STALE_AFTER_SECS))
            .bind(STALE_PROCESSING_ERROR)
            .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        Ok(result.rows_affected())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            JobStoreError::Decode(format!("{}: {}", operation, err))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    subject_id: uuid::Uuid,
    action: String,
    status: String,
    attempts: i32,
    max_attempts: i32,
    last_error: Option<String>,
    scheduled_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, JobStoreError> {
        let read = || -> Result<Self, sqlx::Error> {
            Ok(JobRow {
                id: row.try_get("id")?,
                subject_id: row.try_get("subject_id")?,
                action: row.try_get("action")?,
                status: row.try_get("status")?,
                attempts: row.try_get("attempts")?,
                max_attempts: row.try_get("max_attempts")?,
                last_error: row.try_get("last_error")?,
                scheduled_at: row.try_get("scheduled_at")?,
                processed_at: row.try_get("processed_at")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        };
        read().map_err(|e| JobStoreError::Decode(e.to_string()))
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let action: JobAction = row
            .action
            .parse()
            .map_err(|e| JobStoreError::Decode(format!("job {}: {}", row.id, e)))?;
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e| JobStoreError::Decode(format!("job {}: {}", row.id, e)))?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| JobStoreError::Decode(format!("job {}: negative attempts", row.id)))?;
        let max_attempts = u32::try_from(row.max_attempts)
            .map_err(|_| JobStoreError::Decode(format!("job {}: negative max_attempts", row.id)))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            subject_id: SubjectId::from_uuid(row.subject_id),
            action,
            status,
            attempts,
            max_attempts,
            last_error: row.last_error,
            scheduled_at: row.scheduled_at,
            processed_at: row.processed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
