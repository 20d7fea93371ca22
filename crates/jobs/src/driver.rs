//! Scheduler driver: polls a runner on a background thread.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info};

use backlog_core::JobType;

use crate::config::DriverConfig;
use crate::error::JobResult;
use crate::runner::{JobRunner, RunSummary};
use crate::store::JobStore;
use crate::transaction::TransactionScope;

/// Driver runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriverStats {
    pub polls: u64,
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub lease_conflicts: u64,
    pub leases_lost: u64,
    /// Polls that ended in a storage or transaction error
    pub errors: u64,
    pub uptime_secs: u64,
}

impl DriverStats {
    fn record(&mut self, summary: &RunSummary) {
        self.jobs_processed += summary.leased as u64;
        self.jobs_completed += summary.completed as u64;
        self.jobs_failed += summary.failed as u64;
        self.lease_conflicts += summary.skipped as u64;
        self.leases_lost += summary.lost as u64;
    }
}

/// Handle to control a running driver.
#[derive(Debug)]
pub struct DriverHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<DriverStats>>,
}

impl DriverHandle {
    /// Request graceful shutdown and wait for the current batch to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current driver statistics.
    pub fn stats(&self) -> DriverStats {
        lock(&self.stats).clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }
}

/// Periodically runs ready jobs of a fixed set of types.
pub struct Driver;

impl Driver {
    /// Spawn the driver loop on a named thread.
    ///
    /// A poll that processed a full batch is followed immediately by the
    /// next one; otherwise the driver sleeps for `poll_interval`.
    pub fn spawn<S, T>(
        runner: JobRunner<S, T>,
        job_types: Vec<JobType>,
        config: DriverConfig,
    ) -> JobResult<DriverHandle>
    where
        S: JobStore + Send + 'static,
        T: TransactionScope + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(DriverStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                driver_loop(runner, job_types, config, shutdown_rx, stats_clone);
            })?;

        Ok(DriverHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn driver_loop<S, T>(
    runner: JobRunner<S, T>,
    job_types: Vec<JobType>,
    config: DriverConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<DriverStats>>,
) where
    S: JobStore,
    T: TransactionScope,
{
    info!(
        driver = %config.name,
        runner = %runner.id(),
        job_types = ?job_types,
        "job driver started"
    );
    let start_time = Instant::now();

    loop {
        let result = runner.run_ready_summary(&job_types, Some(config.batch_limit));

        let full_batch = {
            let mut s = lock(&stats);
            s.polls += 1;
            s.uptime_secs = start_time.elapsed().as_secs();
            match &result {
                Ok(summary) => {
                    s.record(summary);
                    summary.leased + summary.skipped >= config.batch_limit
                }
                Err(_) => {
                    s.errors += 1;
                    false
                }
            }
        };

        match result {
            Ok(summary) => debug!(
                driver = %config.name,
                processed = summary.processed(),
                "poll finished"
            ),
            Err(e) => error!(driver = %config.name, error = %e, "failed to run ready jobs"),
        }

        if full_batch {
            // More work is likely waiting
            match shutdown_rx.try_recv() {
                Err(mpsc::TryRecvError::Empty) => continue,
                _ => break,
            }
        }

        match shutdown_rx.recv_timeout(config.poll_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(driver = %config.name, "job driver stopped");
}

fn lock(stats: &Mutex<DriverStats>) -> MutexGuard<'_, DriverStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use backlog_core::{JobStatus, Metadata, TargetId};

    use crate::error::JobExecutionError;
    use crate::registry::{DerivedJob, JobHandler, JobRegistry, TargetLoader};
    use crate::source::JobSource;
    use crate::store::{InMemoryJobStore, JobFilter};

    const SYNC: JobType = JobType::from_static("branch-scan");

    struct Branches;

    impl TargetLoader for Branches {
        type Target = ();

        fn family(&self) -> &str {
            "branch"
        }

        fn load(&self, _id: TargetId) -> anyhow::Result<Option<()>> {
            Ok(Some(()))
        }
    }

    struct Scan;

    impl JobHandler<()> for Scan {
        fn run(&self, job: &mut DerivedJob<'_, ()>) -> Result<(), JobExecutionError> {
            if job.target_ref().id.get() % 2 == 0 {
                return Err(JobExecutionError::failed("branch is stacked on itself"));
            }
            Ok(())
        }
    }

    fn wait_for(handle: &DriverHandle, done: impl Fn(&DriverStats) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(&handle.stats()) {
            assert!(Instant::now() < deadline, "driver made no progress");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn drives_jobs_until_shutdown() {
        let mut registry = JobRegistry::new();
        registry.register(SYNC, || Scan, Branches).unwrap();
        let registry = Arc::new(registry);

        let store = InMemoryJobStore::arc();
        let source = JobSource::new(store.clone(), registry.clone(), SYNC).unwrap();
        for id in 1..=5 {
            source.create(TargetId::new(id), Metadata::new()).unwrap();
        }

        let runner = JobRunner::new(store.clone(), registry);
        let config = DriverConfig::default()
            .with_name("scan-driver")
            .with_poll_interval(Duration::from_millis(10))
            .with_batch_limit(2);
        let handle = Driver::spawn(runner, vec![SYNC], config).unwrap();

        wait_for(&handle, |s| s.jobs_processed == 5);
        let stats = handle.stats();
        assert_eq!(stats.jobs_completed, 3);
        assert_eq!(stats.jobs_failed, 2);
        assert!(stats.polls >= 3);
        assert!(!handle.is_finished());

        handle.shutdown();
        let waiting = source.find(JobFilter::new().status(JobStatus::Waiting));
        assert_eq!(waiting.count().unwrap(), 0);
    }

    #[test]
    fn keeps_polling_after_errors() {
        let runner = JobRunner::new(InMemoryJobStore::new(), Arc::new(JobRegistry::new()));
        let config = DriverConfig::default().with_poll_interval(Duration::from_millis(5));

        // Unregistered type: every poll fails
        let handle = Driver::spawn(runner, vec![SYNC], config).unwrap();
        wait_for(&handle, |s| s.errors >= 2);
        assert_eq!(handle.stats().jobs_processed, 0);
        handle.shutdown();
    }
}
