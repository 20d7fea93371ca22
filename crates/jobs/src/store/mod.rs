//! Durable job storage.
//!
//! The store is the only shared mutable resource of the engine. Every write
//! other than the initial insert is a single-row conditional update:
//!
//! - [`JobStore::try_lease`] matches the status and attempt count the runner
//!   read when it picked the candidate. A `None` means another runner got
//!   there first (lease conflict) and is not an error.
//! - [`JobStore::complete`] / [`JobStore::fail`] match `RUNNING`, the lease
//!   owner and the attempt count. A `None` means the lease was lost to a
//!   reclaim and the transition did not happen.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use backlog_core::{
    Job, JobFailure, JobId, JobStatus, JobType, Metadata, NewJob, RunnerId, TargetId, lease_expiry,
};

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Insert a WAITING job unless a WAITING or RUNNING job with the same
    /// type and target exists, in which case that job is returned unchanged.
    ///
    /// The check and the insert are one atomic step.
    fn insert_unique(&self, job: NewJob) -> Result<Inserted, StoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Jobs matching every set field of `filter`, oldest first.
    fn find(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Ready jobs of the given types, oldest first.
    ///
    /// Ready: WAITING with `scheduled_start <= now`, or RUNNING with
    /// `lease_expires < now`.
    fn ready(
        &self,
        job_types: &[JobType],
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Atomically lease a candidate previously returned by [`JobStore::ready`].
    fn try_lease(&self, claim: &LeaseClaim) -> Result<Option<Job>, StoreError>;

    /// RUNNING → COMPLETED, storing the handler's metadata.
    fn complete(&self, finish: &Finish, metadata: &Metadata) -> Result<Option<Job>, StoreError>;

    /// RUNNING → FAILED, recording the failure. Metadata is left untouched.
    fn fail(&self, finish: &Finish, failure: &JobFailure) -> Result<Option<Job>, StoreError>;

    /// Job counts per status.
    fn stats(&self) -> Result<JobStats, StoreError>;
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn insert_unique(&self, job: NewJob) -> Result<Inserted, StoreError> {
        (**self).insert_unique(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(job_id)
    }

    fn find(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        (**self).find(filter)
    }

    fn ready(
        &self,
        job_types: &[JobType],
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StoreError> {
        (**self).ready(job_types, now, limit)
    }

    fn try_lease(&self, claim: &LeaseClaim) -> Result<Option<Job>, StoreError> {
        (**self).try_lease(claim)
    }

    fn complete(&self, finish: &Finish, metadata: &Metadata) -> Result<Option<Job>, StoreError> {
        (**self).complete(finish, metadata)
    }

    fn fail(&self, finish: &Finish, failure: &JobFailure) -> Result<Option<Job>, StoreError> {
        (**self).fail(finish, failure)
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        (**self).stats()
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("failed to decode stored job: {0}")]
    Decode(String),
    #[error("failed to encode job: {0}")]
    Encode(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Outcome of [`JobStore::insert_unique`].
#[derive(Debug, Clone, PartialEq)]
pub enum Inserted {
    /// A new WAITING job was persisted.
    Created(Job),
    /// An outstanding job for the same type and target already existed.
    Existing(Job),
}

impl Inserted {
    pub fn is_created(&self) -> bool {
        matches!(self, Inserted::Created(_))
    }

    pub fn job(&self) -> &Job {
        match self {
            Inserted::Created(job) | Inserted::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Inserted::Created(job) | Inserted::Existing(job) => job,
        }
    }
}

/// Conditional lease request: succeeds only if the row still has the status
/// and attempt count the runner saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseClaim {
    pub job_id: JobId,
    pub expected_status: JobStatus,
    pub expected_attempts: u32,
    pub owner: RunnerId,
    pub now: DateTime<Utc>,
    pub lease_for: Duration,
}

impl LeaseClaim {
    pub fn for_candidate(
        candidate: &Job,
        owner: RunnerId,
        now: DateTime<Utc>,
        lease_for: Duration,
    ) -> Self {
        Self {
            job_id: candidate.id,
            expected_status: candidate.status,
            expected_attempts: candidate.attempt_count,
            owner,
            now,
            lease_for,
        }
    }

    pub fn lease_expires(&self) -> Result<DateTime<Utc>, StoreError> {
        lease_expiry(self.now, self.lease_for).map_err(|e| StoreError::Encode(e.to_string()))
    }

    /// Whether `job` is still in the state this claim was computed from.
    pub fn matches(&self, job: &Job) -> bool {
        job.id == self.job_id
            && job.status == self.expected_status
            && job.attempt_count == self.expected_attempts
            && job.is_ready(self.now)
    }
}

/// Conditional terminal transition issued by the lease holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finish {
    pub job_id: JobId,
    pub owner: RunnerId,
    pub attempt: u32,
    pub now: DateTime<Utc>,
}

impl Finish {
    pub fn for_lease(leased: &Job, owner: RunnerId, now: DateTime<Utc>) -> Self {
        Self {
            job_id: leased.id,
            owner,
            attempt: leased.attempt_count,
            now,
        }
    }

    /// Whether `job` is still leased by this owner at this attempt.
    pub fn matches(&self, job: &Job) -> bool {
        job.id == self.job_id
            && job.status == JobStatus::Running
            && job.lease_owner == Some(self.owner)
            && job.attempt_count == self.attempt
    }
}

/// Query filter; unset fields match everything, set fields AND together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub target_family: Option<String>,
    pub target_id: Option<TargetId>,
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
    /// Only jobs created at or after this instant.
    pub date_since: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn family(mut self, family: impl Into<String>) -> Self {
        self.target_family = Some(family.into());
        self
    }

    pub fn target(mut self, target_id: TargetId) -> Self {
        self.target_id = Some(target_id);
        self
    }

    pub fn job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn since(mut self, date_since: DateTime<Utc>) -> Self {
        self.date_since = Some(date_since);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.target_family
            .as_ref()
            .is_none_or(|family| &job.target.family == family)
            && self.target_id.is_none_or(|id| job.target.id == id)
            && self.job_type.as_ref().is_none_or(|t| &job.job_type == t)
            && self.status.is_none_or(|s| job.status == s)
            && self.date_since.is_none_or(|since| job.date_created >= since)
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub waiting: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Waiting => self.waiting += count,
            JobStatus::Running => self.running += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> usize {
        self.waiting + self.running + self.completed + self.failed
    }
}
