//! Job lifecycle states and per-target repair outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Scheduler-visible job state.
///
/// Transitions only move forward: `Queued -> Running -> terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Skipped,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Skipped
        )
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        match self {
            Self::Queued => next == Self::Running,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }

    /// Move to `next`, or return the rejected pair if the move would go
    /// backwards or re-enter a terminal state.
    pub fn transition(&mut self, next: JobState) -> Result<(), (JobState, JobState)> {
        if !self.can_transition_to(next) {
            return Err((*self, next));
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Queued => "Queued",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::TimedOut => "TimedOut",
            Self::Skipped => "Skipped",
        };
        f.write_str(label)
    }
}

/// Steps of the per-target repair sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairStep {
    DiagnosePower,
    DiagnoseAgent,
    DiagnoseDisk,
    SwapDisk,
    CreateRepairVm,
    RunRepairScript,
    RestoreDisk,
}

impl RepairStep {
    pub fn label(self) -> &'static str {
        match self {
            Self::DiagnosePower => "diagnose-power",
            Self::DiagnoseAgent => "diagnose-agent",
            Self::DiagnoseDisk => "diagnose-disk",
            Self::SwapDisk => "swap-disk",
            Self::CreateRepairVm => "create-repair-vm",
            Self::RunRepairScript => "run-repair-script",
            Self::RestoreDisk => "restore-disk",
        }
    }
}

impl fmt::Display for RepairStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    NotRunning,
    AlreadyHealthy,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRunning => f.write_str("not running"),
            Self::AlreadyHealthy => f.write_str("already healthy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    OriginalDiskNotFound,
    DiskConflict,
    /// A remote call failed; carries the step it failed in and the error text.
    ControlPlane { step: RepairStep, message: String },
    /// The worker task died without reporting (panic).
    WorkerCrashed(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OriginalDiskNotFound => f.write_str("original disk not found"),
            Self::DiskConflict => f.write_str("disk conflict"),
            Self::ControlPlane { step, message } => write!(f, "{}: {}", step, message),
            Self::WorkerCrashed(detail) => write!(f, "worker crashed: {}", detail),
        }
    }
}

/// Terminal result of one repair attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairOutcome {
    Completed,
    Skipped(SkipReason),
    Failed(FailureReason),
    TimedOut,
}

impl RepairOutcome {
    pub fn job_state(&self) -> JobState {
        match self {
            Self::Completed => JobState::Completed,
            Self::Skipped(_) => JobState::Skipped,
            Self::Failed(_) => JobState::Failed,
            Self::TimedOut => JobState::TimedOut,
        }
    }
}

impl fmt::Display for RepairOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("Completed"),
            Self::Skipped(reason) => write!(f, "Skipped: {}", reason),
            Self::Failed(reason) => write!(f, "Failed: {}", reason),
            Self::TimedOut => f.write_str("TimedOut"),
        }
    }
}
