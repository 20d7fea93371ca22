//! Durable job scheduling and execution.
//!
//! Domain code registers job types once at start-up, creates jobs through a
//! [`JobSource`], and a [`JobRunner`] (usually driven by a [`Driver`]) leases
//! and runs them:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use backlog_core::{JobType, Metadata, TargetId};
//! use backlog_jobs::{
//!     DerivedJob, InMemoryJobStore, JobExecutionError, JobHandler, JobRegistry, JobRunner,
//!     JobSource, TargetLoader,
//! };
//!
//! const INITIALISE: JobType = JobType::from_static("initialise-series");
//!
//! struct DistroSeries;
//!
//! impl TargetLoader for DistroSeries {
//!     type Target = String;
//!
//!     fn family(&self) -> &str {
//!         "distroseries"
//!     }
//!
//!     fn load(&self, id: TargetId) -> anyhow::Result<Option<String>> {
//!         Ok(Some(format!("series-{id}")))
//!     }
//! }
//!
//! struct Initialise;
//!
//! impl JobHandler<String> for Initialise {
//!     fn run(&self, job: &mut DerivedJob<'_, String>) -> Result<(), JobExecutionError> {
//!         let series = job.target().clone();
//!         job.metadata_mut().insert("initialised", series);
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), backlog_jobs::JobError> {
//! backlog_observability::init();
//!
//! let mut registry = JobRegistry::new();
//! registry.register(INITIALISE, || Initialise, DistroSeries)?;
//! let registry = Arc::new(registry);
//!
//! let store = InMemoryJobStore::arc();
//! let source = JobSource::new(store.clone(), registry.clone(), INITIALISE)?;
//! source.create(TargetId::new(42), Metadata::new().with("rebuild", true))?;
//!
//! let runner = JobRunner::new(store, registry);
//! assert_eq!(runner.run_ready(&[INITIALISE], None)?, 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod registry;
pub mod runner;
pub mod source;
pub mod store;
pub mod transaction;


pub use config::{DriverConfig, RunnerConfig};
pub use driver::{Driver, DriverHandle, DriverStats};
pub use error::{JobError, JobExecutionError, JobResult};
pub use registry::{DerivedJob, JobHandler, JobRegistry, RegisteredJobType, TargetLoader};
pub use runner::{JobRunner, RunSummary};
pub use source::{JobQuery, JobSource};
pub use store::{
    Finish, InMemoryJobStore, Inserted, JobFilter, JobStats, JobStore, LeaseClaim,
    PostgresJobStore, StoreError,
};
pub use transaction::{NoTransaction, TransactionScope};
