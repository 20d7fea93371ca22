//! Job creation and lookup for one job type.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use backlog_core::{Clock, Job, JobId, JobType, Metadata, NewJob, SystemClock, TargetId};

use crate::error::JobResult;
use crate::registry::JobRegistry;
use crate::store::{Inserted, JobFilter, JobStore};

/// Creates and finds jobs of one type, for the target family that type is
/// registered against.
pub struct JobSource<S> {
    store: S,
    registry: Arc<JobRegistry>,
    job_type: JobType,
    family: String,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore> JobSource<S> {
    /// Fails with `UnknownJobType` if `job_type` is not registered.
    pub fn new(store: S, registry: Arc<JobRegistry>, job_type: JobType) -> JobResult<Self> {
        let family = registry.resolve(&job_type)?.family().to_string();
        Ok(Self {
            store,
            registry,
            job_type,
            family,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    /// Request a job for `target_id`, runnable immediately.
    ///
    /// If a WAITING or RUNNING job of this type already exists for the
    /// target, that job is returned unchanged and `metadata` is dropped.
    pub fn create(&self, target_id: TargetId, metadata: Metadata) -> JobResult<Job> {
        let now = self.clock.now();
        self.create_job(target_id, metadata, now, now)
    }

    /// Like [`JobSource::create`], but not runnable before `scheduled_start`.
    pub fn create_at(
        &self,
        target_id: TargetId,
        metadata: Metadata,
        scheduled_start: DateTime<Utc>,
    ) -> JobResult<Job> {
        let now = self.clock.now();
        self.create_job(target_id, metadata, now, scheduled_start)
    }

    fn create_job(
        &self,
        target_id: TargetId,
        metadata: Metadata,
        now: DateTime<Utc>,
        scheduled_start: DateTime<Utc>,
    ) -> JobResult<Job> {
        metadata.validate()?;
        let target = self
            .registry
            .resolve(&self.job_type)?
            .check_target(target_id)?;

        let new = NewJob::new(self.job_type.clone(), target, metadata, now)
            .scheduled_at(scheduled_start);

        match self.store.insert_unique(new)? {
            Inserted::Created(job) => {
                debug!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    target = %job.target,
                    scheduled_start = %job.scheduled_start,
                    "job created"
                );
                Ok(job)
            }
            Inserted::Existing(job) => {
                debug!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    target = %job.target,
                    status = %job.status,
                    "outstanding job reused"
                );
                Ok(job)
            }
        }
    }

    /// Jobs of this source's family matching `filter`, oldest first.
    ///
    /// Nothing is read until [`JobQuery::fetch`] is called, and every fetch
    /// re-runs the query.
    pub fn find(&self, filter: JobFilter) -> JobQuery<'_, S> {
        JobQuery {
            store: &self.store,
            filter: filter.family(self.family.clone()),
        }
    }

    /// `None` when the job does not exist or belongs to another family.
    pub fn get_by_id(&self, job_id: JobId) -> JobResult<Option<Job>> {
        let job = self.store.get(job_id)?;
        Ok(job.filter(|j| j.target.family == self.family))
    }
}

impl<S> core::fmt::Debug for JobSource<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobSource")
            .field("job_type", &self.job_type)
            .field("family", &self.family)
            .finish_non_exhaustive()
    }
}

/// Lazy, restartable job query.
#[derive(Debug)]
pub struct JobQuery<'a, S> {
    store: &'a S,
    filter: JobFilter,
}

impl<S: JobStore> JobQuery<'_, S> {
    pub fn filter(&self) -> &JobFilter {
        &self.filter
    }

    pub fn fetch(&self) -> JobResult<Vec<Job>> {
        Ok(self.store.find(&self.filter)?)
    }

    pub fn count(&self) -> JobResult<usize> {
        Ok(self.fetch()?.len())
    }

    /// Oldest matching job.
    pub fn first(&self) -> JobResult<Option<Job>> {
        Ok(self.fetch()?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use backlog_core::{JobStatus, ManualClock, TargetRef};
    use chrono::Duration;

    use crate::error::{JobError, JobExecutionError};
    use crate::registry::{DerivedJob, JobHandler, TargetLoader};
    use crate::store::InMemoryJobStore;

    const UPLOAD: JobType = JobType::from_static("snap-store-upload");

    struct Builds;

    impl TargetLoader for Builds {
        type Target = TargetId;

        fn family(&self) -> &str {
            "snap-build"
        }

        fn load(&self, id: TargetId) -> anyhow::Result<Option<TargetId>> {
            Ok((id.get() < 100).then_some(id))
        }
    }

    struct Upload;

    impl JobHandler<TargetId> for Upload {
        fn run(&self, _job: &mut DerivedJob<'_, TargetId>) -> Result<(), JobExecutionError> {
            Ok(())
        }
    }

    fn source() -> (Arc<InMemoryJobStore>, JobSource<Arc<InMemoryJobStore>>) {
        let mut registry = JobRegistry::new();
        registry.register(UPLOAD, || Upload, Builds).unwrap();
        let store = InMemoryJobStore::arc();
        let source = JobSource::new(store.clone(), Arc::new(registry), UPLOAD).unwrap();
        (store, source)
    }

    #[test]
    fn unknown_job_type_has_no_source() {
        let registry = Arc::new(JobRegistry::new());
        let result = JobSource::new(InMemoryJobStore::new(), registry, UPLOAD);
        assert!(matches!(result, Err(JobError::UnknownJobType(_))));
    }

    #[test]
    fn create_dedups_outstanding_jobs() {
        let (_, source) = source();

        let first = source.create(TargetId::new(7), Metadata::new().with("channel", "edge")).unwrap();
        let second = source.create(TargetId::new(7), Metadata::new().with("channel", "stable")).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.metadata.get_str("channel"), Some("edge"));
        assert_eq!(first.target, TargetRef::new("snap-build", TargetId::new(7)));
        assert_eq!(source.find(JobFilter::new()).count().unwrap(), 1);
    }

    #[test]
    fn create_rejects_missing_target() {
        let (store, source) = source();
        let err = source.create(TargetId::new(500), Metadata::new()).unwrap_err();
        assert!(matches!(err, JobError::InvalidTarget { .. }));
        assert_eq!(store.stats().unwrap().total(), 0);
    }

    #[test]
    fn query_is_restartable() {
        let (_, source) = source();
        let query = source.find(JobFilter::new().status(JobStatus::Waiting));
        assert!(query.fetch().unwrap().is_empty());

        source.create(TargetId::new(1), Metadata::new()).unwrap();
        source.create(TargetId::new(2), Metadata::new()).unwrap();
        let jobs = query.fetch().unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].id < jobs[1].id);
        assert_eq!(query.first().unwrap().map(|j| j.id), Some(jobs[0].id));
    }

    #[test]
    fn create_at_defers_start() {
        let clock = Arc::new(ManualClock::default());
        let (_, source) = source();
        let source = source.with_clock(clock.clone());

        let at = clock.now() + Duration::hours(2);
        let job = source.create_at(TargetId::new(3), Metadata::new(), at).unwrap();
        assert_eq!(job.scheduled_start, at);
        assert_eq!(job.date_created, clock.now());
        assert!(!job.is_ready(clock.now()));
    }

    #[test]
    fn get_by_id_is_scoped_to_family() {
        let (store, source) = source();
        let job = source.create(TargetId::new(4), Metadata::new()).unwrap();
        assert_eq!(source.get_by_id(job.id).unwrap(), Some(job));
        assert_eq!(source.get_by_id(JobId::new(404)).unwrap(), None);

        let foreign = store
            .insert_unique(NewJob::new(
                JobType::from_static("bug-heat-update"),
                TargetRef::new("bug", TargetId::new(4)),
                Metadata::new(),
                Utc::now(),
            ))
            .unwrap()
            .into_job();
        assert_eq!(source.get_by_id(foreign.id).unwrap(), None);
        assert_eq!(source.find(JobFilter::new()).count().unwrap(), 1);
    }
}
