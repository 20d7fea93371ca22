//! Engine error model.
//!
//! Two families of errors exist and are kept apart on purpose:
//!
//! - [`JobError`] is returned to callers of the registry, sources and the
//!   runner. Registry errors are programming errors; `InvalidTarget` is a
//!   synchronous rejection from `create()`; `Storage` is an infrastructure
//!   failure that the driver reports and retries.
//! - [`JobExecutionError`] is returned by domain handlers. The runner turns
//!   it into a FAILED job with a recorded reason and never propagates it.

use backlog_core::{FailureKind, JobType, RecordError, TargetRef};
use thiserror::Error;

use crate::store::StoreError;

/// Result type of engine operations.
pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job type already registered: {0}")]
    DuplicateRegistration(JobType),

    #[error("unknown job type: {0}")]
    UnknownJobType(JobType),

    #[error("invalid target {target}: {reason}")]
    InvalidTarget { target: TargetRef, reason: String },

    /// The target loader itself failed (lookup did not complete).
    #[error("failed to load target {target}: {source:#}")]
    TargetLookup {
        target: TargetRef,
        #[source]
        source: anyhow::Error,
    },

    /// The domain unit of work could not be started.
    #[error("failed to begin unit of work for job {job}: {source:#}")]
    Transaction {
        job: backlog_core::JobId,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to spawn driver thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl JobError {
    pub fn invalid_target(target: TargetRef, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            target,
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Failure signalled by a job handler's `run()`.
#[derive(Debug, Error)]
pub enum JobExecutionError {
    /// Domain failure with a human-readable reason.
    #[error("{0}")]
    Failed(String),

    /// The target entity disappeared after the job was created.
    #[error("target {0} no longer exists")]
    TargetMissing(TargetRef),

    /// Any other error; lets handlers use `?` on `anyhow` results.
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl JobExecutionError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            JobExecutionError::TargetMissing(_) => FailureKind::TargetMissing,
            JobExecutionError::Failed(_) | JobExecutionError::Other(_) => FailureKind::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backlog_core::TargetId;

    #[test]
    fn anyhow_context_is_kept_in_message() {
        let err: JobExecutionError = anyhow::anyhow!("connection reset")
            .context("uploading to store")
            .into();
        assert_eq!(err.to_string(), "uploading to store: connection reset");
        assert_eq!(err.failure_kind(), FailureKind::Error);
    }

    #[test]
    fn missing_target_has_its_own_kind() {
        let err = JobExecutionError::TargetMissing(TargetRef::new("bug", TargetId::new(9)));
        assert_eq!(err.failure_kind(), FailureKind::TargetMissing);
        assert_eq!(err.to_string(), "target bug/9 no longer exists");
    }
}
