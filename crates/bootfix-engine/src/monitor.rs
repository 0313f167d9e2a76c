//! Hang detection for running jobs.

use bootfix_core::JobId;
use std::time::Duration;
use tokio::time::Instant;

/// Flags jobs whose running time has reached the wall-clock budget.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutMonitor {
    job_timeout: Duration,
}

impl TimeoutMonitor {
    pub fn new(job_timeout: Duration) -> Self {
        Self { job_timeout }
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    pub fn is_expired(&self, started_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(started_at) >= self.job_timeout
    }

    /// Ids of the running jobs that have used up their budget.
    pub fn expired<I>(&self, running: I, now: Instant) -> Vec<JobId>
    where
        I: IntoIterator<Item = (JobId, Instant)>,
    {
        running
            .into_iter()
            .filter(|(_, started_at)| self.is_expired(*started_at, now))
            .map(|(id, _)| id)
            .collect()
    }
}
