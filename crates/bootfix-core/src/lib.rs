//! Core domain model and contracts for bootfix.

pub mod credentials;
pub mod disk;
pub mod job;
pub mod protocol;
pub mod report;
pub mod session;
pub mod target;

pub use credentials::Credentials;
pub use disk::{DiskInfo, DiskState};
pub use job::{FailureReason, JobId, JobState, RepairOutcome, RepairStep, SkipReason};
pub use protocol::*;
pub use report::{JobRecord, OutcomeCounts, RunSummary, SubscriptionReport};
pub use session::RepairSession;
pub use target::{Target, TargetRecord};
