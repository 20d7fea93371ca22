//! The generic job record and its status state machine.
//!
//! ```text
//! WAITING --(lease)--> RUNNING --(success)--> COMPLETED   [terminal]
//! RUNNING --(failure)--> FAILED                            [terminal]
//! RUNNING --(lease expired, re-lease)--> RUNNING           [attempt_count += 1]
//! ```

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RecordError, RecordResult};
use crate::id::{JobId, RunnerId, TargetId};
use crate::job_type::JobType;
use crate::metadata::Metadata;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be leased
    Waiting,
    /// Leased by a runner
    Running,
    /// Finished successfully
    Completed,
    /// Finished with a recorded failure
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Waiting,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Waiting or running: counts against the one-outstanding-job-per-target rule.
    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Waiting, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| RecordError::unrecognized(format!("JobStatus: unknown status {s:?}")))
    }
}

/// Back-reference from a job to the entity it acts upon.
///
/// `family` names the kind of entity (`distroseries`, `bug`, `snap-build`);
/// `id` is the entity's id within that family. The job never owns the target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    pub family: String,
    pub id: TargetId,
}

impl TargetRef {
    pub fn new(family: impl Into<String>, id: TargetId) -> Self {
        Self {
            family: family.into(),
            id,
        }
    }
}

impl core::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.family, self.id)
    }
}

/// Why a job ended up FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The handler returned an error.
    Error,
    /// The handler panicked.
    Panic,
    /// The target entity was gone when the job ran.
    TargetMissing,
    /// The handler succeeded but its unit of work failed to commit.
    CommitFailed,
    /// The lease lapsed more often than the runner allows.
    AttemptsExhausted,
}

impl FailureKind {
    const ALL: [FailureKind; 5] = [
        FailureKind::Error,
        FailureKind::Panic,
        FailureKind::TargetMissing,
        FailureKind::CommitFailed,
        FailureKind::AttemptsExhausted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Error => "error",
            FailureKind::Panic => "panic",
            FailureKind::TargetMissing => "target_missing",
            FailureKind::CommitFailed => "commit_failed",
            FailureKind::AttemptsExhausted => "attempts_exhausted",
        }
    }
}

impl FromStr for FailureKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| RecordError::unrecognized(format!("FailureKind: unknown kind {s:?}")))
    }
}

/// Failure reason recorded on a FAILED job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl core::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// A job that has not been persisted yet (no id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: JobType,
    pub target: TargetRef,
    pub metadata: Metadata,
    pub scheduled_start: DateTime<Utc>,
    pub date_created: DateTime<Utc>,
}

impl NewJob {
    /// A job runnable as soon as it is created.
    pub fn new(
        job_type: JobType,
        target: TargetRef,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_type,
            target,
            metadata,
            scheduled_start: now,
            date_created: now,
        }
    }

    /// Defer the earliest start.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_start = at;
        self
    }

    /// Materialize the WAITING row once the store has assigned an id.
    pub fn into_job(self, id: JobId) -> Job {
        Job {
            id,
            job_type: self.job_type,
            target: self.target,
            status: JobStatus::Waiting,
            metadata: self.metadata,
            lease_expires: None,
            lease_owner: None,
            attempt_count: 0,
            scheduled_start: self.scheduled_start,
            date_created: self.date_created,
            date_started: None,
            date_finished: None,
            failure: None,
        }
    }
}

/// One durable unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub target: TargetRef,
    pub status: JobStatus,
    pub metadata: Metadata,
    pub lease_expires: Option<DateTime<Utc>>,
    pub lease_owner: Option<RunnerId>,
    pub attempt_count: u32,
    pub scheduled_start: DateTime<Utc>,
    pub date_created: DateTime<Utc>,
    /// When the current (or last) lease was taken.
    pub date_started: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
    pub failure: Option<JobFailure>,
}

impl Job {
    /// WAITING and past its scheduled start, or RUNNING with a lapsed lease.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Waiting => self.scheduled_start <= now,
            JobStatus::Running => self.lease_expires.is_some_and(|exp| exp < now),
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }

    /// Take (or reclaim) the lease.
    pub fn lease(
        &mut self,
        owner: RunnerId,
        now: DateTime<Utc>,
        lease_for: Duration,
    ) -> RecordResult<()> {
        if !self.status.can_transition_to(JobStatus::Running) || !self.is_ready(now) {
            return Err(RecordError::transition(self.status, JobStatus::Running));
        }
        let expires = lease_expiry(now, lease_for)?;
        self.status = JobStatus::Running;
        self.attempt_count += 1;
        self.lease_owner = Some(owner);
        self.lease_expires = Some(expires);
        self.date_started = Some(now);
        Ok(())
    }

    /// RUNNING → COMPLETED, replacing metadata with the handler's copy.
    pub fn complete(&mut self, metadata: Metadata, now: DateTime<Utc>) -> RecordResult<()> {
        self.finish(JobStatus::Completed, now)?;
        self.metadata = metadata;
        Ok(())
    }

    /// RUNNING → FAILED with a recorded reason. Metadata is left untouched.
    pub fn fail(&mut self, failure: JobFailure, now: DateTime<Utc>) -> RecordResult<()> {
        self.finish(JobStatus::Failed, now)?;
        self.failure = Some(failure);
        Ok(())
    }

    fn finish(&mut self, to: JobStatus, now: DateTime<Utc>) -> RecordResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(RecordError::transition(self.status, to));
        }
        self.status = to;
        self.lease_expires = None;
        self.date_finished = Some(now);
        Ok(())
    }
}

/// `now + lease_for`, or an error when the sum leaves chrono's range.
pub fn lease_expiry(now: DateTime<Utc>, lease_for: Duration) -> RecordResult<DateTime<Utc>> {
    now.checked_add_signed(lease_for).ok_or_else(|| {
        RecordError::invalid_lease(format!("lease of {lease_for} from {now} overflows"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(now: DateTime<Utc>) -> Job {
        NewJob::new(
            JobType::from_static("initialise-series"),
            TargetRef::new("distroseries", TargetId::new(42)),
            Metadata::new().with("rebuild", true),
            now,
        )
        .into_job(JobId::new(1))
    }

    #[test]
    fn job_lifecycle() {
        let now = Utc::now();
        let mut job = new_job(now);
        assert_eq!(job.status, JobStatus::Waiting);
        assert!(job.is_ready(now));

        let owner = RunnerId::new();
        job.lease(owner, now, Duration::minutes(5)).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.lease_owner, Some(owner));
        assert!(job.lease_expires.unwrap() > now);
        assert!(!job.is_ready(now));

        job.complete(Metadata::new().with("done", true), now).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.date_finished, Some(now));
        assert_eq!(job.metadata.get_bool("done"), Some(true));
    }

    #[test]
    fn deferred_job_is_not_ready_early() {
        let now = Utc::now();
        let mut job = new_job(now);
        job.scheduled_start = now + Duration::hours(1);
        assert!(!job.is_ready(now));
        assert!(job.lease(RunnerId::new(), now, Duration::minutes(5)).is_err());
        assert!(job.is_ready(now + Duration::hours(1)));
    }

    #[test]
    fn expired_lease_is_reclaimable() {
        let now = Utc::now();
        let mut job = new_job(now);
        job.lease(RunnerId::new(), now, Duration::minutes(5)).unwrap();

        let later = now + Duration::minutes(6);
        assert!(job.is_ready(later));
        job.lease(RunnerId::new(), later, Duration::minutes(5)).unwrap();
        assert_eq!(job.attempt_count, 2);
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let now = Utc::now();
        let mut job = new_job(now);
        job.lease(RunnerId::new(), now, Duration::minutes(5)).unwrap();
        job.fail(JobFailure::new(FailureKind::Error, "boom"), now)
            .unwrap();

        let snapshot = job.clone();
        let later = now + Duration::days(1);
        assert!(job.lease(RunnerId::new(), later, Duration::minutes(5)).is_err());
        assert!(job.complete(Metadata::new(), later).is_err());
        assert!(matches!(
            job.fail(JobFailure::new(FailureKind::Error, "again"), later),
            Err(RecordError::InvalidTransition {
                from: JobStatus::Failed,
                to: JobStatus::Failed
            })
        ));
        assert_eq!(job, snapshot);
    }

    #[test]
    fn oversized_lease_leaves_job_untouched() {
        let now = Utc::now();
        let mut job = new_job(now);
        let snapshot = job.clone();

        let err = job
            .lease(RunnerId::new(), now, Duration::days(200_000_000))
            .unwrap_err();
        assert!(matches!(err, RecordError::InvalidLease(_)));
        assert_eq!(job, snapshot);
        assert!(job.lease(RunnerId::new(), now, Duration::minutes(5)).is_ok());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<JobStatus>().is_err());
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Running));
    }
}
