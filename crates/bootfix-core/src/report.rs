//! Outcome records collected by the scheduler and summarised per run.

use crate::job::{JobId, JobState, RepairOutcome, RepairStep};
use crate::target::Target;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One reaped job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub target: Target,
    pub state: JobState,
    pub outcome: RepairOutcome,
    /// Steps the worker entered, in order. Empty for timed-out jobs whose
    /// worker never reported back.
    pub steps: Vec<RepairStep>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn duration_secs(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionReport {
    pub subscription_name: String,
    pub subscription_id: String,
    /// In reaping order, not input order.
    pub records: Vec<JobRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub timed_out: usize,
}

impl OutcomeCounts {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.skipped + self.timed_out
    }

    fn add(&mut self, outcome: &RepairOutcome) {
        match outcome {
            RepairOutcome::Completed => self.completed += 1,
            RepairOutcome::Failed(_) => self.failed += 1,
            RepairOutcome::Skipped(_) => self.skipped += 1,
            RepairOutcome::TimedOut => self.timed_out += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub subscriptions: Vec<SubscriptionReport>,
}

impl RunSummary {
    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for record in self.records() {
            counts.add(&record.outcome);
        }
        counts
    }

    pub fn records(&self) -> impl Iterator<Item = &JobRecord> {
        self.subscriptions.iter().flat_map(|s| s.records.iter())
    }
}
