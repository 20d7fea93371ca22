//! Job type registry.
//!
//! Maps each [`JobType`] to the handler that runs it and the loader that
//! finds its target entity. A registry is filled once at start-up and then
//! shared read-only (`Arc<JobRegistry>`) with every source and runner that
//! needs it; nothing reaches it through global state.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Duration;

use backlog_core::{Job, JobId, JobType, Metadata, TargetId, TargetRef};

use crate::config::check_lease_duration;
use crate::error::{JobError, JobExecutionError};

/// Finds the target entities of one family (distro series, bugs, ...).
pub trait TargetLoader: Send + Sync + 'static {
    type Target: Send + Sync + 'static;

    /// Family name stored on every job of this loader's types.
    fn family(&self) -> &str;

    /// `Ok(None)` when the entity does not exist.
    fn load(&self, id: TargetId) -> anyhow::Result<Option<Self::Target>>;

    /// Whether `target` can host a job of `job_type` at all.
    ///
    /// Checked at creation time; the default accepts every existing target.
    fn check_hostable(&self, job_type: &JobType, target: &Self::Target) -> Result<(), String> {
        let _ = (job_type, target);
        Ok(())
    }
}

/// Domain logic of one job type.
pub trait JobHandler<T>: Send + Sync {
    fn run(&self, job: &mut DerivedJob<'_, T>) -> Result<(), JobExecutionError>;
}

/// A job bound to its loaded target entity.
///
/// The handler sees the job read-only and works on a copy of its metadata;
/// the copy is written back only if the job completes.
#[derive(Debug)]
pub struct DerivedJob<'a, T> {
    job: &'a Job,
    target: &'a T,
    metadata: Metadata,
}

impl<'a, T> DerivedJob<'a, T> {
    pub fn new(job: &'a Job, target: &'a T) -> Self {
        Self {
            job,
            target,
            metadata: job.metadata.clone(),
        }
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn job_type(&self) -> &JobType {
        &self.job.job_type
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn target(&self) -> &T {
        self.target
    }

    pub fn target_ref(&self) -> &TargetRef {
        &self.job.target
    }

    /// 1 on the first lease, higher when a lapsed lease was reclaimed.
    pub fn attempt_count(&self) -> u32 {
        self.job.attempt_count
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn into_metadata(self) -> Metadata {
        self.metadata
    }
}

/// Type-erased registration, so one registry can hold every family.
trait Registration: Send + Sync {
    fn check_target(&self, job_type: &JobType, target: &TargetRef) -> Result<(), JobError>;
    fn execute(&self, job: &Job) -> Result<Metadata, JobExecutionError>;
}

struct Bound<L, C, H> {
    loader: L,
    construct: C,
    _handler: PhantomData<fn() -> H>,
}

impl<L, C, H> Registration for Bound<L, C, H>
where
    L: TargetLoader,
    C: Fn() -> H + Send + Sync + 'static,
    H: JobHandler<L::Target>,
{
    fn check_target(&self, job_type: &JobType, target: &TargetRef) -> Result<(), JobError> {
        let loaded = self
            .loader
            .load(target.id)
            .map_err(|source| JobError::TargetLookup {
                target: target.clone(),
                source,
            })?;

        let Some(entity) = loaded else {
            return Err(JobError::invalid_target(target.clone(), "target does not exist"));
        };

        self.loader
            .check_hostable(job_type, &entity)
            .map_err(|reason| JobError::invalid_target(target.clone(), reason))
    }

    fn execute(&self, job: &Job) -> Result<Metadata, JobExecutionError> {
        let entity = self
            .loader
            .load(job.target.id)?
            .ok_or_else(|| JobExecutionError::TargetMissing(job.target.clone()))?;

        let handler = (self.construct)();
        let mut derived = DerivedJob::new(job, &entity);
        handler.run(&mut derived)?;
        Ok(derived.into_metadata())
    }
}

/// A resolved registry entry.
pub struct RegisteredJobType {
    job_type: JobType,
    family: String,
    lease_duration: Option<Duration>,
    registration: Box<dyn Registration>,
}

impl RegisteredJobType {
    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    /// Per-type lease override, if one was configured.
    pub fn lease_duration(&self) -> Option<Duration> {
        self.lease_duration
    }

    pub fn target_ref(&self, id: TargetId) -> TargetRef {
        TargetRef::new(self.family.clone(), id)
    }

    /// Reject targets that are missing or cannot host this job type.
    pub fn check_target(&self, id: TargetId) -> Result<TargetRef, JobError> {
        let target = self.target_ref(id);
        self.registration.check_target(&self.job_type, &target)?;
        Ok(target)
    }

    /// Load the target, build a fresh handler and run it. Returns the
    /// handler's metadata on success.
    pub fn execute(&self, job: &Job) -> Result<Metadata, JobExecutionError> {
        self.registration.execute(job)
    }
}

impl core::fmt::Debug for RegisteredJobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegisteredJobType")
            .field("job_type", &self.job_type)
            .field("family", &self.family)
            .field("lease_duration", &self.lease_duration)
            .finish_non_exhaustive()
    }
}

/// Registration table, populated once at process start.
#[derive(Debug, Default)]
pub struct JobRegistry {
    entries: HashMap<JobType, RegisteredJobType>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job_type`. `handler_constructor` builds a fresh handler
    /// for every execution; `target_loader` resolves its targets.
    pub fn register<L, C, H>(
        &mut self,
        job_type: JobType,
        handler_constructor: C,
        target_loader: L,
    ) -> Result<(), JobError>
    where
        L: TargetLoader,
        C: Fn() -> H + Send + Sync + 'static,
        H: JobHandler<L::Target> + 'static,
    {
        if self.entries.contains_key(&job_type) {
            return Err(JobError::DuplicateRegistration(job_type));
        }

        let entry = RegisteredJobType {
            job_type: job_type.clone(),
            family: target_loader.family().to_string(),
            lease_duration: None,
            registration: Box::new(Bound {
                loader: target_loader,
                construct: handler_constructor,
                _handler: PhantomData,
            }),
        };
        tracing::debug!(job_type = %job_type, family = %entry.family, "registered job type");
        self.entries.insert(job_type, entry);
        Ok(())
    }

    /// Override the runner's default lease for one job type.
    pub fn set_lease_duration(
        &mut self,
        job_type: &JobType,
        lease_duration: Duration,
    ) -> Result<(), JobError> {
        let entry = self
            .entries
            .get_mut(job_type)
            .ok_or_else(|| JobError::UnknownJobType(job_type.clone()))?;
        check_lease_duration(lease_duration)?;
        entry.lease_duration = Some(lease_duration);
        Ok(())
    }

    pub fn resolve(&self, job_type: &JobType) -> Result<&RegisteredJobType, JobError> {
        self.entries
            .get(job_type)
            .ok_or_else(|| JobError::UnknownJobType(job_type.clone()))
    }

    pub fn contains(&self, job_type: &JobType) -> bool {
        self.entries.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.entries.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
