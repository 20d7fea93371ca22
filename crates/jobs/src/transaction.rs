//! Unit of work wrapped around each job execution.
//!
//! The runner begins a scope before calling the handler and either commits
//! it (handler succeeded) or rolls it back (handler failed or panicked). The
//! scope is committed before the job is marked COMPLETED, so a crash between
//! the two leaves a RUNNING job that is re-leased once its lease lapses.

use backlog_core::Job;

/// The domain's transactional boundary for one job.
pub trait TransactionScope: Send + Sync {
    fn begin(&self, job: &Job) -> anyhow::Result<()>;

    fn commit(&self, job: &Job) -> anyhow::Result<()>;

    fn rollback(&self, job: &Job) -> anyhow::Result<()>;
}

/// Scope for handlers whose side effects need no coordination.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransaction;

impl TransactionScope for NoTransaction {
    fn begin(&self, _job: &Job) -> anyhow::Result<()> {
        Ok(())
    }

    fn commit(&self, _job: &Job) -> anyhow::Result<()> {
        Ok(())
    }

    fn rollback(&self, _job: &Job) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<T: TransactionScope + ?Sized> TransactionScope for std::sync::Arc<T> {
    fn begin(&self, job: &Job) -> anyhow::Result<()> {
        (**self).begin(job)
    }

    fn commit(&self, job: &Job) -> anyhow::Result<()> {
        (**self).commit(job)
    }

    fn rollback(&self, job: &Job) -> anyhow::Result<()> {
        (**self).rollback(job)
    }
}
