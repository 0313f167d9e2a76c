use std::time::Duration;

/// Remote repair procedure run on the repair VM unless configured otherwise.
pub const DEFAULT_REPAIR_SCRIPT_ID: &str = "win-crowdstrike-fix-bootloop";
pub const DEFAULT_REPAIR_ADMIN_USER: &str = "repairadmin";
pub const DEFAULT_SWAP_GRACE_SECS: u64 = 60;

pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 20;
pub const DEFAULT_JOB_TIMEOUT_MINUTES: u64 = 70;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_PROGRESS_EVERY_TICKS: u64 = 30;

/// Knobs for the per-target repair sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairSettings {
    pub script_id: String,
    pub admin_user: String,
    /// Wait after restarting a VM on its original disk. The guest agent
    /// is not expected to be up when this elapses.
    pub swap_grace: Duration,
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self {
            script_id: DEFAULT_REPAIR_SCRIPT_ID.to_string(),
            admin_user: DEFAULT_REPAIR_ADMIN_USER.to_string(),
            swap_grace: Duration::from_secs(DEFAULT_SWAP_GRACE_SECS),
        }
    }
}

/// Knobs for one subscription batch's worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_concurrent_jobs: usize,
    pub job_timeout: Duration,
    pub poll_interval: Duration,
    /// Emit a progress line every this many polls while waiting.
    pub progress_every_ticks: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            job_timeout: Duration::from_secs(DEFAULT_JOB_TIMEOUT_MINUTES * 60),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            progress_every_ticks: DEFAULT_PROGRESS_EVERY_TICKS,
        }
    }
}

impl PoolSettings {
    /// Zero values would stall or spin the drain loop.
    pub fn sanitized(mut self) -> Self {
        self.max_concurrent_jobs = self.max_concurrent_jobs.max(1);
        if self.poll_interval.is_zero() {
            self.poll_interval = Duration::from_millis(1);
        }
        self.progress_every_ticks = self.progress_every_ticks.max(1);
        self
    }
}
