//! Repair orchestration engine for bootfix.
//!
//! [`RepairMachine`] drives one target; [`WorkerPool`] runs a bounded number
//! of them concurrently with a hang timeout; [`Orchestrator`] walks the
//! subscriptions one batch at a time.

pub mod monitor;
pub mod orchestrator;
pub mod pool;
pub mod repair;
pub mod settings;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use monitor::TimeoutMonitor;
pub use orchestrator::{group_by_subscription, Orchestrator, Phase, SubscriptionGroup};
pub use pool::WorkerPool;
pub use repair::{RepairMachine, RepairRun};
pub use settings::{PoolSettings, RepairSettings};
