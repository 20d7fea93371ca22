//! Runner and driver configuration.
//!
//! Every setting has a default and can be overridden from the environment:
//!
//! | variable | setting |
//! |----------|---------|
//! | `BACKLOG_LEASE_SECS` | [`RunnerConfig::lease_duration`] |
//! | `BACKLOG_MAX_ATTEMPTS` | [`RunnerConfig::max_attempts`] |
//! | `BACKLOG_POLL_INTERVAL_MS` | [`DriverConfig::poll_interval`] |
//! | `BACKLOG_BATCH_LIMIT` | [`DriverConfig::batch_limit`] |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{JobError, JobResult};

pub const LEASE_SECS_VAR: &str = "BACKLOG_LEASE_SECS";
pub const MAX_ATTEMPTS_VAR: &str = "BACKLOG_MAX_ATTEMPTS";
pub const POLL_INTERVAL_MS_VAR: &str = "BACKLOG_POLL_INTERVAL_MS";
pub const BATCH_LIMIT_VAR: &str = "BACKLOG_BATCH_LIMIT";

/// Longest lease a runner or job type may hold.
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Leases must be positive and at most [`MAX_LEASE_DURATION`].
pub fn check_lease_duration(lease_duration: Duration) -> JobResult<()> {
    if lease_duration.is_zero() {
        return Err(JobError::config("lease duration must be positive"));
    }
    if lease_duration > MAX_LEASE_DURATION {
        return Err(JobError::config(format!(
            "lease duration {lease_duration:?} exceeds {MAX_LEASE_DURATION:?}"
        )));
    }
    Ok(())
}

/// Job runner configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Default lease, unless the job type registers its own
    pub lease_duration: Duration,
    /// A job leased more often than this is failed without running
    pub max_attempts: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(300),
            max_attempts: 5,
        }
    }
}

impl RunnerConfig {
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Defaults overridden by `BACKLOG_*` environment variables.
    pub fn from_env() -> JobResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> JobResult<Self> {
        let mut config = Self::default();
        if let Some(secs) = parse_var::<u64>(&lookup, LEASE_SECS_VAR)? {
            let lease_duration = Duration::from_secs(secs);
            check_lease_duration(lease_duration)
                .map_err(|e| JobError::config(format!("{LEASE_SECS_VAR}: {e}")))?;
            config.lease_duration = lease_duration;
        }
        if let Some(max) = parse_var::<u32>(&lookup, MAX_ATTEMPTS_VAR)? {
            if max == 0 {
                return Err(JobError::config(format!("{MAX_ATTEMPTS_VAR} must be positive")));
            }
            config.max_attempts = max;
        }
        Ok(config)
    }
}

/// Scheduler driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Thread name and log field
    pub name: String,
    /// Pause between polls that found less than a full batch
    pub poll_interval: Duration,
    /// Maximum jobs per `run_ready` call
    pub batch_limit: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: "job-driver".to_string(),
            poll_interval: Duration::from_secs(1),
            batch_limit: 100,
        }
    }
}

impl DriverConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit;
        self
    }

    pub fn from_env() -> JobResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> JobResult<Self> {
        let mut config = Self::default();
        if let Some(ms) = parse_var::<u64>(&lookup, POLL_INTERVAL_MS_VAR)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(limit) = parse_var::<usize>(&lookup, BATCH_LIMIT_VAR)? {
            if limit == 0 {
                return Err(JobError::config(format!("{BATCH_LIMIT_VAR} must be positive")));
            }
            config.batch_limit = limit;
        }
        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> JobResult<Option<T>>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|e| JobError::config(format!("{key}={raw:?}: {e}")))
}
