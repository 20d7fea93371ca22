//! Job runner: leases ready jobs and executes them one at a time.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use backlog_core::{Clock, FailureKind, Job, JobFailure, JobType, Metadata, RunnerId, SystemClock};

use crate::config::{RunnerConfig, check_lease_duration};
use crate::error::{JobError, JobResult};
use crate::registry::{JobRegistry, RegisteredJobType};
use crate::store::{Finish, JobStore, LeaseClaim};
use crate::transaction::{NoTransaction, TransactionScope};

/// Outcome of one [`JobRunner::run_ready_summary`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Jobs this runner leased (and therefore processed)
    pub leased: usize,
    pub completed: usize,
    pub failed: usize,
    /// Candidates another runner leased first
    pub skipped: usize,
    /// Leases that lapsed and were reclaimed before the job could finish
    pub lost: usize,
}

impl RunSummary {
    /// Jobs leased and executed, whatever their outcome.
    pub fn processed(&self) -> usize {
        self.leased
    }
}

enum Outcome {
    Completed,
    Failed,
    Lost,
}

/// Leases and executes ready jobs.
///
/// Each job is leased with a conditional update, run inside its own
/// [`TransactionScope`], and finished with a conditional terminal update.
/// A failing or panicking handler fails only its own job.
pub struct JobRunner<S, T = NoTransaction> {
    id: RunnerId,
    store: S,
    registry: Arc<JobRegistry>,
    scope: T,
    clock: Arc<dyn Clock>,
    config: RunnerConfig,
}

impl<S: JobStore> JobRunner<S> {
    pub fn new(store: S, registry: Arc<JobRegistry>) -> Self {
        Self {
            id: RunnerId::new(),
            store,
            registry,
            scope: NoTransaction,
            clock: Arc::new(SystemClock),
            config: RunnerConfig::default(),
        }
    }
}

impl<S: JobStore, T: TransactionScope> JobRunner<S, T> {
    pub fn with_transaction_scope<U: TransactionScope>(self, scope: U) -> JobRunner<S, U> {
        JobRunner {
            id: self.id,
            store: self.store,
            registry: self.registry,
            scope,
            clock: self.clock,
            config: self.config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Lease owner recorded on every job this runner takes.
    pub fn id(&self) -> RunnerId {
        self.id
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run up to `limit` ready jobs of `job_types`, oldest first.
    ///
    /// Returns how many jobs were leased and executed, whether they ended
    /// COMPLETED or FAILED.
    pub fn run_ready(&self, job_types: &[JobType], limit: Option<usize>) -> JobResult<usize> {
        Ok(self.run_ready_summary(job_types, limit)?.processed())
    }

    pub fn run_ready_summary(
        &self,
        job_types: &[JobType],
        limit: Option<usize>,
    ) -> JobResult<RunSummary> {
        // Reject unregistered types before anything is leased
        let entries = job_types
            .iter()
            .map(|t| self.registry.resolve(t))
            .collect::<Result<Vec<_>, _>>()?;

        let mut summary = RunSummary::default();
        if entries.is_empty() || limit == Some(0) {
            return Ok(summary);
        }

        let candidates = self.store.ready(job_types, self.clock.now(), limit)?;
        for candidate in &candidates {
            let entry = self.registry.resolve(&candidate.job_type)?;

            let Some(job) = self.lease(entry, candidate)? else {
                summary.skipped += 1;
                continue;
            };
            summary.leased += 1;

            match self.execute(entry, &job)? {
                Outcome::Completed => summary.completed += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::Lost => summary.lost += 1,
            }
        }

        if summary.leased > 0 || summary.skipped > 0 {
            info!(
                runner = %self.id,
                leased = summary.leased,
                completed = summary.completed,
                failed = summary.failed,
                skipped = summary.skipped,
                lost = summary.lost,
                "ran ready jobs"
            );
        }
        Ok(summary)
    }

    fn lease(&self, entry: &RegisteredJobType, candidate: &Job) -> JobResult<Option<Job>> {
        let lease_for = entry.lease_duration().unwrap_or(self.config.lease_duration);
        check_lease_duration(lease_for)
            .map_err(|e| JobError::config(format!("{}: {e}", entry.job_type())))?;
        let lease_for = chrono::Duration::from_std(lease_for)
            .map_err(|e| JobError::config(format!("lease duration out of range: {e}")))?;

        let claim = LeaseClaim::for_candidate(candidate, self.id, self.clock.now(), lease_for);
        let leased = self.store.try_lease(&claim)?;

        match &leased {
            Some(job) => debug!(
                runner = %self.id,
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempt_count,
                lease_expires = ?job.lease_expires,
                "leased job"
            ),
            None => debug!(
                runner = %self.id,
                job_id = %candidate.id,
                job_type = %candidate.job_type,
                "job leased by another runner"
            ),
        }
        Ok(leased)
    }

    fn execute(&self, entry: &RegisteredJobType, job: &Job) -> JobResult<Outcome> {
        if job.attempt_count > self.config.max_attempts {
            let failure = JobFailure::new(
                FailureKind::AttemptsExhausted,
                format!(
                    "leased {} times, limit is {}",
                    job.attempt_count, self.config.max_attempts
                ),
            );
            return self.fail(job, failure);
        }

        self.scope
            .begin(job)
            .map_err(|source| JobError::Transaction { job: job.id, source })?;

        let result = catch_unwind(AssertUnwindSafe(|| entry.execute(job)));

        let failure = match result {
            Ok(Ok(metadata)) => match metadata.validate() {
                Ok(()) => match self.scope.commit(job) {
                    Ok(()) => return self.complete(job, &metadata),
                    Err(e) => JobFailure::new(FailureKind::CommitFailed, format!("{e:#}")),
                },
                Err(e) => {
                    self.rollback(job);
                    JobFailure::new(FailureKind::Error, e.to_string())
                }
            },
            Ok(Err(err)) => {
                self.rollback(job);
                JobFailure::new(err.failure_kind(), err.to_string())
            }
            Err(payload) => {
                self.rollback(job);
                JobFailure::new(FailureKind::Panic, panic_message(payload.as_ref()))
            }
        };
        self.fail(job, failure)
    }

    fn rollback(&self, job: &Job) {
        if let Err(e) = self.scope.rollback(job) {
            let error = format!("{e:#}");
            warn!(
                runner = %self.id,
                job_id = %job.id,
                job_type = %job.job_type,
                error = %error,
                "rollback failed"
            );
        }
    }

    fn complete(&self, job: &Job, metadata: &Metadata) -> JobResult<Outcome> {
        let finish = Finish::for_lease(job, self.id, self.clock.now());
        match self.store.complete(&finish, metadata)? {
            Some(done) => {
                debug!(
                    runner = %self.id,
                    job_id = %done.id,
                    job_type = %done.job_type,
                    attempt = done.attempt_count,
                    "job completed"
                );
                Ok(Outcome::Completed)
            }
            None => Ok(self.lost(job)),
        }
    }

    fn fail(&self, job: &Job, failure: JobFailure) -> JobResult<Outcome> {
        let finish = Finish::for_lease(job, self.id, self.clock.now());
        match self.store.fail(&finish, &failure)? {
            Some(failed) => {
                warn!(
                    runner = %self.id,
                    job_id = %failed.id,
                    job_type = %failed.job_type,
                    attempt = failed.attempt_count,
                    failure_kind = failure.kind.as_str(),
                    reason = %failure.message,
                    "job failed"
                );
                Ok(Outcome::Failed)
            }
            None => Ok(self.lost(job)),
        }
    }

    fn lost(&self, job: &Job) -> Outcome {
        warn!(
            runner = %self.id,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt_count,
            "lease lost before job finished"
        );
        Outcome::Lost
    }
}

impl<S, T> core::fmt::Debug for JobRunner<S, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobRunner")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("handler panicked: {msg}")
    } else {
        "handler panicked".to_string()
    }
}
