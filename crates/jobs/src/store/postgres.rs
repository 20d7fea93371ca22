//! Postgres-backed job store implementation.
//!
//! Jobs live in a single `job` table (see `migrations/0001_job.sql`). The
//! engine's concurrency guarantees are pushed down into the database:
//!
//! - **Dedup**: a partial unique index on `(job_type, target_family,
//!   target_id) WHERE status IN ('waiting', 'running')`. `insert_unique`
//!   issues `INSERT ... ON CONFLICT DO NOTHING RETURNING` and, when nothing
//!   was inserted, reads the outstanding row back.
//! - **Leasing**: one `UPDATE ... WHERE id = $1 AND status = $2 AND
//!   attempt_count = $3 RETURNING ...`. Under `READ COMMITTED` a racing
//!   update re-evaluates the predicate against the committed row and matches
//!   zero rows, so exactly one runner wins.
//! - **Terminal transitions**: the same pattern, matched on `status =
//!   'running'`, the lease owner and the attempt count.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError | Scenario |
//! |------------|------------|----------|
//! | Database (any code) | `Storage` | constraint violations, serialization failures |
//! | PoolClosed / PoolTimedOut | `Storage` | connection pool exhausted or closed |
//! | Column decode / unknown enum text | `Decode` | row written by an incompatible version |
//! | Other | `Storage` | network errors, connection failures, etc. |
//!
//! ## Runtime
//!
//! [`JobStore`] is synchronous. `PostgresJobStore` owns a small tokio runtime
//! and blocks on it, so it must be called from a plain thread (the
//! [`Driver`](crate::driver::Driver) thread, `spawn_blocking`, a CLI main), never from
//! inside an async task.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tokio::runtime::Runtime;
use tracing::instrument;

use backlog_core::{
    FailureKind, Job, JobFailure, JobId, JobStatus, JobType, Metadata, NewJob, RunnerId, TargetId,
    TargetRef,
};

use super::{Finish, Inserted, JobFilter, JobStats, JobStore, LeaseClaim, StoreError};

/// Schema applied by [`PostgresJobStore::ensure_schema`].
pub const SCHEMA: &str = include_str!("../../migrations/0001_job.sql");

/// How often `insert_unique` retries when the outstanding job it collided
/// with finishes before it can be read back.
const INSERT_RETRIES: usize = 3;

macro_rules! job_columns {
    () => {
        "id, job_type, target_family, target_id, status, metadata, lease_expires, \
         lease_owner, attempt_count, scheduled_start, date_created, date_started, \
         date_finished, failure_kind, failure_message"
    };
}

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    runtime: Arc<Runtime>,
}

impl PostgresJobStore {
    /// Connect to `database_url` with a pool of at most `max_connections`.
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("backlog-pg")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Storage(format!("failed to start runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `job` table and its indexes if they do not exist.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.runtime.block_on(async {
            sqlx::raw_sql(SCHEMA)
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(|e| map_sqlx_error("ensure_schema", e))
        })
    }

    #[instrument(
        skip(self, new),
        fields(job_type = %new.job_type, target = %new.target),
        err
    )]
    async fn insert_or_existing(&self, new: NewJob) -> Result<Inserted, StoreError> {
        let metadata = new
            .metadata
            .to_json()
            .map_err(|e| StoreError::Encode(e.to_string()))?;

        for _ in 0..INSERT_RETRIES {
            let inserted = sqlx::query(concat!(
                "INSERT INTO job (job_type, target_family, target_id, status, metadata, \
                 attempt_count, scheduled_start, date_created) \
                 VALUES ($1, $2, $3, 'waiting', $4, 0, $5, $6) \
                 ON CONFLICT (job_type, target_family, target_id) \
                 WHERE status IN ('waiting', 'running') DO NOTHING \
                 RETURNING ",
                job_columns!()
            ))
            .bind(new.job_type.as_str())
            .bind(&new.target.family)
            .bind(new.target.id.get())
            .bind(&metadata)
            .bind(new.scheduled_start)
            .bind(new.date_created)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_job", e))?;

            if let Some(row) = inserted {
                return Ok(Inserted::Created(decode(&row)?));
            }

            let existing = sqlx::query(concat!(
                "SELECT ",
                job_columns!(),
                " FROM job \
                 WHERE job_type = $1 AND target_family = $2 AND target_id = $3 \
                 AND status IN ('waiting', 'running')"
            ))
            .bind(new.job_type.as_str())
            .bind(&new.target.family)
            .bind(new.target.id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("select_outstanding_job", e))?;

            if let Some(row) = existing {
                return Ok(Inserted::Existing(decode(&row)?));
            }
            // The conflicting job reached a terminal state in between; go again.
        }

        Err(StoreError::Storage(format!(
            "outstanding {} job for {} kept changing during insert",
            new.job_type, new.target
        )))
    }

    #[instrument(skip(self), err)]
    async fn select_one(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(concat!("SELECT ", job_columns!(), " FROM job WHERE id = $1"))
            .bind(job_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(decode).transpose()
    }

    #[instrument(skip(self), err)]
    async fn select_filtered(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM job \
             WHERE ($1::text IS NULL OR target_family = $1) \
             AND ($2::bigint IS NULL OR target_id = $2) \
             AND ($3::text IS NULL OR job_type = $3) \
             AND ($4::text IS NULL OR status = $4) \
             AND ($5::timestamptz IS NULL OR date_created >= $5) \
             ORDER BY date_created ASC, id ASC"
        ))
        .bind(filter.target_family.as_deref())
        .bind(filter.target_id.map(|id| id.get()))
        .bind(filter.job_type.as_ref().map(|t| t.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.date_since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_jobs", e))?;

        rows.iter().map(decode).collect()
    }

    #[instrument(skip(self), err)]
    async fn select_ready(
        &self,
        job_types: &[JobType],
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StoreError> {
        let job_types: Vec<String> = job_types.iter().map(|t| t.as_str().to_string()).collect();

        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM job \
             WHERE job_type = ANY($1) \
             AND ((status = 'waiting' AND scheduled_start <= $2) \
                  OR (status = 'running' AND lease_expires < $2)) \
             ORDER BY date_created ASC, id ASC \
             LIMIT $3"
        ))
        .bind(job_types)
        .bind(now)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ready_jobs", e))?;

        rows.iter().map(decode).collect()
    }

    #[instrument(
        skip(self, claim),
        fields(job_id = %claim.job_id, owner = %claim.owner),
        err
    )]
    async fn update_lease(&self, claim: &LeaseClaim) -> Result<Option<Job>, StoreError> {
        let lease_expires = claim.lease_expires()?;
        let row = sqlx::query(concat!(
            "UPDATE job SET status = 'running', attempt_count = attempt_count + 1, \
             lease_owner = $4, lease_expires = $5, date_started = $6 \
             WHERE id = $1 AND status = $2 AND attempt_count = $3 \
             AND ((status = 'waiting' AND scheduled_start <= $6) \
                  OR (status = 'running' AND lease_expires < $6)) \
             RETURNING ",
            job_columns!()
        ))
        .bind(claim.job_id.get())
        .bind(claim.expected_status.as_str())
        .bind(attempts_to_db(claim.expected_attempts)?)
        .bind(claim.owner.as_uuid())
        .bind(lease_expires)
        .bind(claim.now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("lease_job", e))?;

        row.as_ref().map(decode).transpose()
    }

    #[instrument(skip(self, metadata), fields(job_id = %finish.job_id), err)]
    async fn update_complete(
        &self,
        finish: &Finish,
        metadata: &Metadata,
    ) -> Result<Option<Job>, StoreError> {
        let metadata = metadata
            .to_json()
            .map_err(|e| StoreError::Encode(e.to_string()))?;
        let row = sqlx::query(concat!(
            "UPDATE job SET status = 'completed', metadata = $4, lease_expires = NULL, \
             date_finished = $5 \
             WHERE id = $1 AND status = 'running' AND lease_owner = $2 AND attempt_count = $3 \
             RETURNING ",
            job_columns!()
        ))
        .bind(finish.job_id.get())
        .bind(finish.owner.as_uuid())
        .bind(attempts_to_db(finish.attempt)?)
        .bind(metadata)
        .bind(finish.now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_job", e))?;

        row.as_ref().map(decode).transpose()
    }

    #[instrument(skip(self, failure), fields(job_id = %finish.job_id, kind = failure.kind.as_str()), err)]
    async fn update_fail(
        &self,
        finish: &Finish,
        failure: &JobFailure,
    ) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(concat!(
            "UPDATE job SET status = 'failed', failure_kind = $4, failure_message = $5, \
             lease_expires = NULL, date_finished = $6 \
             WHERE id = $1 AND status = 'running' AND lease_owner = $2 AND attempt_count = $3 \
             RETURNING ",
            job_columns!()
        ))
        .bind(finish.job_id.get())
        .bind(finish.owner.as_uuid())
        .bind(attempts_to_db(finish.attempt)?)
        .bind(failure.kind.as_str())
        .bind(&failure.message)
        .bind(finish.now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_job", e))?;

        row.as_ref().map(decode).transpose()
    }

    #[instrument(skip(self), err)]
    async fn count_by_status(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM job GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| StoreError::Decode(format!("failed to read status: {e}")))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| StoreError::Decode(format!("failed to read count: {e}")))?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            stats.record(status, total as usize);
        }
        Ok(stats)
    }
}

impl JobStore for PostgresJobStore {
    fn insert_unique(&self, job: NewJob) -> Result<Inserted, StoreError> {
        self.runtime.block_on(self.insert_or_existing(job))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.runtime.block_on(self.select_one(job_id))
    }

    fn find(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        self.runtime.block_on(self.select_filtered(filter))
    }

    fn ready(
        &self,
        job_types: &[JobType],
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StoreError> {
        self.runtime
            .block_on(self.select_ready(job_types, now, limit))
    }

    fn try_lease(&self, claim: &LeaseClaim) -> Result<Option<Job>, StoreError> {
        self.runtime.block_on(self.update_lease(claim))
    }

    fn complete(&self, finish: &Finish, metadata: &Metadata) -> Result<Option<Job>, StoreError> {
        self.runtime
            .block_on(self.update_complete(finish, metadata))
    }

    fn fail(&self, finish: &Finish, failure: &JobFailure) -> Result<Option<Job>, StoreError> {
        self.runtime.block_on(self.update_fail(finish, failure))
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        self.runtime.block_on(self.count_by_status())
    }
}

fn attempts_to_db(attempts: u32) -> Result<i32, StoreError> {
    i32::try_from(attempts)
        .map_err(|_| StoreError::Storage(format!("attempt count {attempts} out of range")))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            StoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Storage(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("{operation}: {err}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn decode(row: &PgRow) -> Result<Job, StoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| StoreError::Decode(format!("failed to deserialize job row: {e}")))?;
    Job::try_from(row)
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: i64,
    job_type: String,
    target_family: String,
    target_id: i64,
    status: String,
    metadata: serde_json::Value,
    lease_expires: Option<DateTime<Utc>>,
    lease_owner: Option<uuid::Uuid>,
    attempt_count: i32,
    scheduled_start: DateTime<Utc>,
    date_created: DateTime<Utc>,
    date_started: Option<DateTime<Utc>>,
    date_finished: Option<DateTime<Utc>>,
    failure_kind: Option<String>,
    failure_message: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            target_family: row.try_get("target_family")?,
            target_id: row.try_get("target_id")?,
            status: row.try_get("status")?,
            metadata: row.try_get("metadata")?,
            lease_expires: row.try_get("lease_expires")?,
            lease_owner: row.try_get("lease_owner")?,
            attempt_count: row.try_get("attempt_count")?,
            scheduled_start: row.try_get("scheduled_start")?,
            date_created: row.try_get("date_created")?,
            date_started: row.try_get("date_started")?,
            date_finished: row.try_get("date_finished")?,
            failure_kind: row.try_get("failure_kind")?,
            failure_message: row.try_get("failure_message")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let decode_err = |e: backlog_core::RecordError| {
            StoreError::Decode(format!("job {}: {e}", row.id))
        };

        let failure = match row.failure_kind.as_deref() {
            Some(kind) => Some(JobFailure::new(
                kind.parse::<FailureKind>().map_err(decode_err)?,
                row.failure_message.clone().unwrap_or_default(),
            )),
            None => None,
        };

        Ok(Job {
            id: JobId::new(row.id),
            job_type: JobType::parse(row.job_type.clone()).map_err(decode_err)?,
            target: TargetRef::new(row.target_family.clone(), TargetId::new(row.target_id)),
            status: row.status.parse::<JobStatus>().map_err(decode_err)?,
            metadata: Metadata::from_json(row.metadata.clone()).map_err(decode_err)?,
            lease_expires: row.lease_expires,
            lease_owner: row.lease_owner.map(RunnerId::from_uuid),
            attempt_count: u32::try_from(row.attempt_count).map_err(|_| {
                StoreError::Decode(format!("job {}: negative attempt count", row.id))
            })?,
            scheduled_start: row.scheduled_start,
            date_created: row.date_created,
            date_started: row.date_started,
            date_finished: row.date_finished,
            failure,
        })
    }
}

/// `LIMIT` parameter; values beyond `i64::MAX` saturate.
fn sql_limit(limit: Option<usize>) -> Option<i64> {
    limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> JobRow {
        let now = Utc::now();
        JobRow {
            id: 7,
            job_type: "snap-store-upload".to_string(),
            target_family: "snap-build".to_string(),
            target_id: 1234,
            status: "failed".to_string(),
            metadata: serde_json::json!({"channels": ["edge"]}),
            lease_expires: None,
            lease_owner: Some(uuid::Uuid::now_v7()),
            attempt_count: 1,
            scheduled_start: now,
            date_created: now,
            date_started: Some(now),
            date_finished: Some(now),
            failure_kind: Some("error".to_string()),
            failure_message: Some("store rejected upload".to_string()),
        }
    }

    #[test]
    fn decodes_failed_row() {
        let job = Job::try_from(sample_row()).unwrap();
        assert_eq!(job.id, JobId::new(7));
        assert_eq!(job.target, TargetRef::new("snap-build", TargetId::new(1234)));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.failure,
            Some(JobFailure::new(FailureKind::Error, "store rejected upload"))
        );
    }

    #[test]
    fn unknown_status_is_a_decode_error() {
        let mut row = sample_row();
        row.status = "cancelled".to_string();
        assert!(matches!(Job::try_from(row), Err(StoreError::Decode(msg)) if msg.contains("cancelled")));
    }

    #[test]
    fn negative_attempts_are_rejected() {
        let mut row = sample_row();
        row.attempt_count = -1;
        assert!(matches!(Job::try_from(row), Err(StoreError::Decode(_))));
    }

    #[test]
    fn oversized_limits_saturate() {
        assert_eq!(sql_limit(None), None);
        assert_eq!(sql_limit(Some(100)), Some(100));
        assert_eq!(sql_limit(Some(usize::MAX)), Some(i64::MAX));
    }

    #[test]
    fn schema_declares_partial_unique_index() {
        assert!(SCHEMA.contains("CREATE UNIQUE INDEX IF NOT EXISTS job_one_pending_per_target"));
        assert!(SCHEMA.contains("WHERE status IN ('waiting', 'running')"));
    }
}
