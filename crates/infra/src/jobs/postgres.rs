//! Postgres-backed job store.
//!
//! ## Concurrency
//!
//! - `claim_next` is a single `UPDATE … WHERE id = (SELECT … FOR UPDATE SKIP LOCKED)`,
//!   so concurrent workers never claim the same row and never block on each other.
//! - Idempotency is enforced by a partial unique index over active states; enqueue
//!   uses `ON CONFLICT DO NOTHING` and falls back to reading the existing row.
//! - `finalize` and `reset_stuck` are compare-and-set updates guarded by
//!   `(state, attempts)` and `(state, started_at)` respectively.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check violation) | `23514` | `Storage` |
//! | Database (other) / PoolClosed / Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use docqueue_core::{JobId, JobState, SubjectId};

use super::store::{JobStore, JobStoreError};
use super::types::{
    EnqueueResult, Job, JobStats, JobType, Outcome, Priority, StuckResolution, to_chrono,
    STUCK_EXHAUSTED_ERROR, STUCK_RESET_ERROR,
};

/// Table and index definitions. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    seq             BIGSERIAL NOT NULL,
    id              UUID PRIMARY KEY,
    job_type        TEXT NOT NULL,
    idempotency_key TEXT NOT NULL CHECK (octet_length(idempotency_key) BETWEEN 1 AND 255),
    subject_id      TEXT,
    payload         JSONB NOT NULL,
    priority        SMALLINT NOT NULL CHECK (priority BETWEEN 1 AND 3),
    state           TEXT NOT NULL
                    CHECK (state IN ('queued', 'processing', 'completed', 'failed', 'dead')),
    attempts        INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
    max_attempts    INTEGER NOT NULL CHECK (max_attempts >= 1),
    next_run_at     TIMESTAMPTZ NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    started_at      TIMESTAMPTZ,
    completed_at    TIMESTAMPTZ,
    error           TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS jobs_active_idempotency_key
    ON jobs (idempotency_key) WHERE state IN ('queued', 'processing');

CREATE INDEX IF NOT EXISTS jobs_claim_order
    ON jobs (priority, created_at, seq) WHERE state = 'queued';

CREATE INDEX IF NOT EXISTS jobs_processing_started_at
    ON jobs (started_at) WHERE state = 'processing';

CREATE INDEX IF NOT EXISTS jobs_completed_at
    ON jobs (completed_at) WHERE completed_at IS NOT NULL;

CREATE INDEX IF NOT EXISTS jobs_subject
    ON jobs (subject_id, created_at DESC) WHERE subject_id IS NOT NULL;
"#;

const COLUMNS: &str = "id, job_type, idempotency_key, subject_id, payload, priority, state, \
                       attempts, max_attempts, next_run_at, created_at, started_at, \
                       completed_at, error";

/// Rounds of insert-then-lookup before enqueue gives up on a key that keeps flipping
/// between active and terminal.
const ENQUEUE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `jobs` table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn fetch_active_id(&self, idempotency_key: &str) -> Result<Option<JobId>, JobStoreError> {
        let row = sqlx::query(
            "SELECT id FROM jobs WHERE idempotency_key = $1 AND state IN ('queued', 'processing')",
        )
        .bind(idempotency_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_active_id", e))?;

        row.map(|r| {
            r.try_get::<Uuid, _>("id")
                .map(JobId::from_uuid)
                .map_err(|e| JobStoreError::Storage(format!("failed to read id: {e}")))
        })
        .transpose()
    }

    /// `NotFound` if the row is gone, otherwise `Conflict`.
    async fn lost_race(&self, job_id: JobId, operation: &str) -> JobStoreError {
        match self.get(job_id).await {
            Ok(None) => JobStoreError::NotFound(job_id),
            Ok(Some(job)) => JobStoreError::Conflict(format!(
                "{operation}: job {job_id} is {} at attempt {}",
                job.state, job.attempts
            )),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, job_type = %job.job_type, idempotency_key = %job.idempotency_key),
        err
    )]
    async fn enqueue(&self, job: Job) -> Result<EnqueueResult, JobStoreError> {
        for _ in 0..ENQUEUE_ATTEMPTS {
            let inserted = sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, job_type, idempotency_key, subject_id, payload, priority, state,
                    attempts, max_attempts, next_run_at, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (idempotency_key) WHERE state IN ('queued', 'processing')
                DO NOTHING
                RETURNING id
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(job.job_type.as_str())
            .bind(&job.idempotency_key)
            .bind(job.subject_id.as_ref().map(|s| s.as_str()))
            .bind(&job.payload)
            .bind(i16::from(job.priority.value()))
            .bind(job.state.as_str())
            .bind(job.attempts as i32)
            .bind(job.max_attempts as i32)
            .bind(job.next_run_at)
            .bind(job.created_at)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;

            if inserted.is_some() {
                return Ok(EnqueueResult {
                    job_id: job.id,
                    created: true,
                });
            }

            // The conflicting job may have finished between the insert and this read;
            // in that case the key is free again and the insert is retried.
            if let Some(existing) = self.fetch_active_id(&job.idempotency_key).await? {
                return Ok(EnqueueResult {
                    job_id: existing,
                    created: false,
                });
            }
        }

        Err(JobStoreError::Conflict(format!(
            "idempotency key {} kept changing state during enqueue",
            job.idempotency_key
        )))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self), fields(subject_id = %subject_id), err)]
    async fn list_by_subject(
        &self,
        subject_id: &SubjectId,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs WHERE subject_id = $1 \
             ORDER BY created_at DESC, seq DESC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(subject_id.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_subject", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let query = format!(
            "UPDATE jobs \
             SET state = 'processing', started_at = $1, attempts = attempts + 1 \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE state = 'queued' AND next_run_at <= $1 \
                 ORDER BY priority ASC, created_at ASC, seq ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self, outcome), fields(job_id = %job_id), err)]
    async fn finalize(
        &self,
        job_id: JobId,
        attempt: u32,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let target = FinalizeColumns::from_outcome(&outcome, now);
        let query = format!(
            "UPDATE jobs \
             SET state = $3, \
                 next_run_at = COALESCE($4, next_run_at), \
                 started_at = CASE WHEN $3 = 'queued' THEN NULL ELSE started_at END, \
                 completed_at = $5, \
                 error = $6 \
             WHERE id = $1 AND state = 'processing' AND attempts = $2 \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(job_id.as_uuid())
            .bind(attempt as i32)
            .bind(target.state.as_str())
            .bind(target.next_run_at)
            .bind(target.completed_at)
            .bind(target.error)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("finalize", e))?;

        match row {
            Some(row) => Job::try_from(row),
            None => Err(self.lost_race(job_id, "finalize").await),
        }
    }

    #[instrument(skip(self), err)]
    async fn find_stuck(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE state = 'processing' AND started_at < $1 \
             ORDER BY started_at ASC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(started_before)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_stuck", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn reset_stuck(
        &self,
        job_id: JobId,
        observed_started_at: DateTime<Utc>,
        resolution: StuckResolution,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let (state, next_run_at, completed_at, error) = match resolution {
            StuckResolution::Requeue { next_run_at } => {
                (JobState::Queued, Some(next_run_at), None, STUCK_RESET_ERROR)
            }
            StuckResolution::Fail => (JobState::Failed, None, Some(now), STUCK_EXHAUSTED_ERROR),
        };

        let query = format!(
            "UPDATE jobs \
             SET state = $3, \
                 attempts = LEAST(attempts + 1, GREATEST(max_attempts, attempts)), \
                 next_run_at = COALESCE($4, next_run_at), \
                 started_at = CASE WHEN $3 = 'queued' THEN NULL ELSE started_at END, \
                 completed_at = $5, \
                 error = $6 \
             WHERE id = $1 AND state = 'processing' AND started_at = $2 \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(job_id.as_uuid())
            .bind(observed_started_at)
            .bind(state.as_str())
            .bind(next_run_at)
            .bind(completed_at)
            .bind(error)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reset_stuck", e))?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn dead_letter_failed(&self, before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let query = format!(
            "UPDATE jobs SET state = 'dead' \
             WHERE state = 'failed' AND completed_at < $1 \
             RETURNING {COLUMNS}"
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(before)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dead_letter_failed", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    #[instrument(skip(self), err)]
    async fn prune_terminal(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            "DELETE FROM jobs \
             WHERE state IN ('completed', 'failed', 'dead') AND completed_at < $1",
        )
        .bind(before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("prune_terminal", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS total FROM jobs GROUP BY state")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row
                .try_get("state")
                .map_err(|e| JobStoreError::Storage(format!("failed to read state: {e}")))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| JobStoreError::Storage(format!("failed to read count: {e}")))?;
            let state = state
                .parse::<JobState>()
                .map_err(|e| JobStoreError::Storage(e.to_string()))?;
            stats.add(state, total.max(0) as u64);
        }
        Ok(stats)
    }
}

/// Column values written by `finalize`.
struct FinalizeColumns {
    state: JobState,
    next_run_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl FinalizeColumns {
    fn from_outcome(outcome: &Outcome, now: DateTime<Utc>) -> Self {
        match outcome {
            Outcome::Completed => Self {
                state: JobState::Completed,
                next_run_at: None,
                completed_at: Some(now),
                error: None,
            },
            Outcome::RetryAfter { delay, error } => Self {
                state: JobState::Queued,
                next_run_at: Some(now + to_chrono(*delay)),
                completed_at: None,
                error: Some(error.clone()),
            },
            Outcome::Failed { error } => Self {
                state: JobState::Failed,
                next_run_at: None,
                completed_at: Some(now),
                error: Some(error.clone()),
            },
        }
    }
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Conflict(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        other => JobStoreError::Storage(format!("{} failed: {}", operation, other)),
    }
}

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    job_type: String,
    idempotency_key: String,
    subject_id: Option<String>,
    payload: serde_json::Value,
    priority: i16,
    state: String,
    attempts: i32,
    max_attempts: i32,
    next_run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            idempotency_key: row.try_get("idempotency_key")?,
            subject_id: row.try_get("subject_id")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            state: row.try_get("state")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            next_run_at: row.try_get("next_run_at")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |e: docqueue_core::DomainError| {
            JobStoreError::Storage(format!("corrupt job row {}: {e}", row.id))
        };

        let job_type = row.job_type.parse::<JobType>().map_err(corrupt)?;
        let state = row.state.parse::<JobState>().map_err(corrupt)?;
        let priority = u8::try_from(row.priority)
            .map_err(|_| JobStoreError::Storage(format!("corrupt priority {}", row.priority)))
            .and_then(|p| Priority::new(p).map_err(corrupt))?;
        let subject_id = row
            .subject_id
            .as_deref()
            .map(SubjectId::parse)
            .transpose()
            .map_err(corrupt)?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            job_type,
            idempotency_key: row.idempotency_key,
            subject_id,
            payload: row.payload,
            priority,
            state,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            next_run_at: row.next_run_at,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error: row.error,
        })
    }
}
