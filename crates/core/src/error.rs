//! Record-level error model.

use thiserror::Error;

use crate::job::JobStatus;

/// Result type used across the record layer.
pub type RecordResult<T> = Result<T, RecordError>;

/// Error raised while building or transitioning a job record.
///
/// Keep this focused on deterministic failures of the record itself
/// (validation, state machine). Storage concerns belong to the engine crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// A job type tag was malformed.
    #[error("invalid job type: {0}")]
    InvalidJobType(String),

    /// A metadata document could not be built or decoded.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A stored enum value (status, failure kind) was not recognized.
    #[error("unrecognized value: {0}")]
    Unrecognized(String),

    /// A lease would expire outside the representable time range.
    #[error("invalid lease: {0}")]
    InvalidLease(String),

    /// The requested status change is not an edge of the state machine.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}

impl RecordError {
    pub fn invalid_job_type(msg: impl Into<String>) -> Self {
        Self::InvalidJobType(msg.into())
    }

    pub fn invalid_metadata(msg: impl Into<String>) -> Self {
        Self::InvalidMetadata(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unrecognized(msg: impl Into<String>) -> Self {
        Self::Unrecognized(msg.into())
    }

    pub fn invalid_lease(msg: impl Into<String>) -> Self {
        Self::InvalidLease(msg.into())
    }

    pub fn transition(from: JobStatus, to: JobStatus) -> Self {
        Self::InvalidTransition { from, to }
    }
}
