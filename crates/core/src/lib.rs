//! `backlog-core`: job record building blocks.
//!
//! This crate contains the **pure record** types of the job engine (no
//! storage, no execution): identifiers, job type tags, the status state
//! machine and the metadata document.

pub mod error;
pub mod id;
pub mod job;
pub mod job_type;
pub mod metadata;
pub mod time;

pub use error::{RecordError, RecordResult};
pub use id::{JobId, RunnerId, TargetId};
pub use job::{FailureKind, Job, JobFailure, JobStatus, NewJob, TargetRef, lease_expiry};
pub use job_type::JobType;
pub use metadata::{Metadata, MetadataValue};
pub use time::{Clock, ManualClock, SystemClock};
