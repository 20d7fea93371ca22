//! In-memory job store.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use backlog_core::{Job, JobFailure, JobId, JobType, Metadata, NewJob};

use super::{Finish, Inserted, JobFilter, JobStats, JobStore, LeaseClaim, StoreError};

#[derive(Debug, Default)]
struct Table {
    next_id: i64,
    jobs: BTreeMap<JobId, Job>,
}

/// In-memory job store for tests/dev.
///
/// Every check-then-write runs under a single write lock, which gives the
/// same guarantees as the conditional updates of the Postgres store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    table: RwLock<Table>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Table>, StoreError> {
        self.table
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Table>, StoreError> {
        self.table
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn sorted(mut jobs: Vec<Job>) -> Vec<Job> {
        jobs.sort_by_key(|j| (j.date_created, j.id));
        jobs
    }
}

impl JobStore for InMemoryJobStore {
    fn insert_unique(&self, new: NewJob) -> Result<Inserted, StoreError> {
        new.metadata.validate().map_err(encode_err)?;
        let mut table = self.write()?;

        let outstanding = table.jobs.values().find(|j| {
            j.status.is_pending() && j.job_type == new.job_type && j.target == new.target
        });
        if let Some(existing) = outstanding {
            return Ok(Inserted::Existing(existing.clone()));
        }

        table.next_id += 1;
        let job = new.into_job(JobId::new(table.next_id));
        table.jobs.insert(job.id, job.clone());
        Ok(Inserted::Created(job))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    fn find(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let table = self.read()?;
        let jobs = table
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        Ok(Self::sorted(jobs))
    }

    fn ready(
        &self,
        job_types: &[JobType],
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StoreError> {
        let table = self.read()?;
        let candidates = table
            .jobs
            .values()
            .filter(|j| job_types.contains(&j.job_type) && j.is_ready(now))
            .cloned()
            .collect();

        let mut candidates = Self::sorted(candidates);
        if let Some(limit) = limit {
            candidates.truncate(limit);
        }
        Ok(candidates)
    }

    fn try_lease(&self, claim: &LeaseClaim) -> Result<Option<Job>, StoreError> {
        claim.lease_expires()?;
        let mut table = self.write()?;
        let Some(job) = table.jobs.get_mut(&claim.job_id) else {
            return Err(StoreError::NotFound(claim.job_id));
        };

        if !claim.matches(job) {
            return Ok(None);
        }

        job.lease(claim.owner, claim.now, claim.lease_for)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(Some(job.clone()))
    }

    fn complete(&self, finish: &Finish, metadata: &Metadata) -> Result<Option<Job>, StoreError> {
        metadata.validate().map_err(encode_err)?;
        let mut table = self.write()?;
        let Some(job) = table.jobs.get_mut(&finish.job_id) else {
            return Err(StoreError::NotFound(finish.job_id));
        };

        if !finish.matches(job) {
            return Ok(None);
        }

        job.complete(metadata.clone(), finish.now)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(Some(job.clone()))
    }

    fn fail(&self, finish: &Finish, failure: &JobFailure) -> Result<Option<Job>, StoreError> {
        let mut table = self.write()?;
        let Some(job) = table.jobs.get_mut(&finish.job_id) else {
            return Err(StoreError::NotFound(finish.job_id));
        };

        if !finish.matches(job) {
            return Ok(None);
        }

        job.fail(failure.clone(), finish.now)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(Some(job.clone()))
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        let table = self.read()?;
        let mut stats = JobStats::default();
        for job in table.jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}

fn encode_err(e: backlog_core::RecordError) -> StoreError {
    StoreError::Encode(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use backlog_core::{FailureKind, JobStatus, RunnerId, TargetId, TargetRef};
    use chrono::Duration;

    const MERGE: JobType = JobType::from_static("translation-merge");

    fn new_job(target: i64, now: DateTime<Utc>) -> NewJob {
        NewJob::new(
            MERGE,
            TargetRef::new("pofile", TargetId::new(target)),
            Metadata::new(),
            now,
        )
    }

    fn lease_first(store: &InMemoryJobStore, owner: RunnerId, now: DateTime<Utc>) -> Option<Job> {
        let candidate = store.ready(&[MERGE], now, Some(1)).unwrap().pop()?;
        let claim = LeaseClaim::for_candidate(&candidate, owner, now, Duration::minutes(5));
        store.try_lease(&claim).unwrap()
    }

    #[test]
    fn enqueue_and_lease() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let job = store.insert_unique(new_job(1, now)).unwrap().into_job();
        let leased = lease_first(&store, RunnerId::new(), now).unwrap();
        assert_eq!(leased.id, job.id);
        assert_eq!(leased.status, JobStatus::Running);
        assert_eq!(leased.attempt_count, 1);

        // Nothing else is ready
        assert!(lease_first(&store, RunnerId::new(), now).is_none());
    }

    #[test]
    fn insert_unique_returns_outstanding_job() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let first = store.insert_unique(new_job(7, now)).unwrap();
        let second = store.insert_unique(new_job(7, now)).unwrap();
        assert!(first.is_created());
        assert!(!second.is_created());
        assert_eq!(first.job().id, second.job().id);

        // A different target is independent
        assert!(store.insert_unique(new_job(8, now)).unwrap().is_created());
    }

    #[test]
    fn stale_claim_is_a_conflict() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.insert_unique(new_job(1, now)).unwrap();

        let candidate = store.ready(&[MERGE], now, None).unwrap().remove(0);
        let a = LeaseClaim::for_candidate(&candidate, RunnerId::new(), now, Duration::minutes(5));
        let b = LeaseClaim::for_candidate(&candidate, RunnerId::new(), now, Duration::minutes(5));

        assert!(store.try_lease(&a).unwrap().is_some());
        assert!(store.try_lease(&b).unwrap().is_none());
    }

    #[test]
    fn finish_requires_current_lease() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.insert_unique(new_job(1, now)).unwrap();

        let crashed = RunnerId::new();
        let leased = lease_first(&store, crashed, now).unwrap();

        // Another runner reclaims after expiry
        let later = now + Duration::minutes(10);
        let reclaimed = lease_first(&store, RunnerId::new(), later).unwrap();
        assert_eq!(reclaimed.attempt_count, 2);

        // The original owner can no longer finish the job
        let stale = Finish::for_lease(&leased, crashed, later);
        assert!(store.complete(&stale, &Metadata::new()).unwrap().is_none());
        let failure = JobFailure::new(FailureKind::Error, "late");
        assert!(store.fail(&stale, &failure).unwrap().is_none());
        assert_eq!(store.get(leased.id).unwrap().unwrap().status, JobStatus::Running);
    }

    #[test]
    fn unencodable_writes_leave_the_store_usable() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let mut nan = new_job(1, now);
        nan.metadata = Metadata::new().with("ratio", f64::NAN);
        assert!(matches!(store.insert_unique(nan), Err(StoreError::Encode(_))));

        store.insert_unique(new_job(1, now)).unwrap();
        let candidate = store.ready(&[MERGE], now, None).unwrap().remove(0);
        let forever =
            LeaseClaim::for_candidate(&candidate, RunnerId::new(), now, Duration::days(200_000_000));
        assert!(matches!(store.try_lease(&forever), Err(StoreError::Encode(_))));

        let owner = RunnerId::new();
        let leased = lease_first(&store, owner, now).unwrap();
        let finish = Finish::for_lease(&leased, owner, now);
        let bad = Metadata::new().with("ratio", f64::INFINITY);
        assert!(matches!(store.complete(&finish, &bad), Err(StoreError::Encode(_))));

        assert_eq!(store.get(leased.id).unwrap().unwrap().status, JobStatus::Running);
        assert_eq!(store.stats().unwrap().running, 1);
    }

    #[test]
    fn unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let finish = Finish {
            job_id: JobId::new(99),
            owner: RunnerId::new(),
            attempt: 1,
            now: Utc::now(),
        };
        assert!(matches!(
            store.complete(&finish, &Metadata::new()),
            Err(StoreError::NotFound(id)) if id == JobId::new(99)
        ));
        assert!(store.get(JobId::new(99)).unwrap().is_none());
    }

    #[test]
    fn stats_tracking() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        for target in 0..5 {
            store.insert_unique(new_job(target, now)).unwrap();
        }
        assert_eq!(store.stats().unwrap().waiting, 5);

        let owner = RunnerId::new();
        lease_first(&store, owner, now).unwrap();
        let leased = lease_first(&store, owner, now).unwrap();
        store
            .complete(&Finish::for_lease(&leased, owner, now), &Metadata::new())
            .unwrap()
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.waiting, 3);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total(), 5);
    }
}
