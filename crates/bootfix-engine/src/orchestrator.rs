//! Subscription-by-subscription batch driver.
//!
//! Targets are grouped by owning subscription and each group runs as its
//! own pool lifecycle: authenticate, resolve the subscription id, dispatch,
//! drain. The next group starts only after the previous one has fully
//! drained, so one authenticated context covers a whole batch.

use crate::pool::WorkerPool;
use crate::settings::{PoolSettings, RepairSettings};
use anyhow::{Context, Result};
use bootfix_core::{ControlPlane, Credentials, RunSummary, SubscriptionReport, TargetRecord};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Targets that share one subscription, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionGroup {
    pub subscription: String,
    pub records: Vec<TargetRecord>,
}

/// Partition records by subscription name.
///
/// Groups come back sorted by subscription name with each name appearing
/// once; records keep their input order within a group.
pub fn group_by_subscription(records: Vec<TargetRecord>) -> Vec<SubscriptionGroup> {
    let mut groups: BTreeMap<String, Vec<TargetRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry(record.subscription.trim().to_string())
            .or_default()
            .push(record);
    }
    groups
        .into_iter()
        .map(|(subscription, records)| SubscriptionGroup {
            subscription,
            records,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Authenticating,
    ResolvingSubscription,
    Dispatching,
    Draining,
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Authenticating => "authenticating",
            Self::ResolvingSubscription => "resolving-subscription",
            Self::Dispatching => "dispatching",
            Self::Draining => "draining",
            Self::Finished => "finished",
        };
        f.write_str(label)
    }
}

pub struct Orchestrator {
    control_plane: Arc<dyn ControlPlane>,
    credentials: Credentials,
    pool: PoolSettings,
    repair: Arc<RepairSettings>,
}

impl Orchestrator {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        credentials: Credentials,
        pool: PoolSettings,
        repair: RepairSettings,
    ) -> Self {
        Self {
            control_plane,
            credentials,
            pool,
            repair: Arc::new(repair),
        }
    }

    /// Run every target to a terminal state.
    ///
    /// Per-target failures are recorded in the summary. Only failing to
    /// authenticate or resolve a subscription aborts the run.
    pub async fn run(&self, records: Vec<TargetRecord>) -> Result<RunSummary> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let groups = group_by_subscription(records);
        info!(run_id = %run_id, subscriptions = groups.len(), "Starting repair run");

        let mut subscriptions = Vec::with_capacity(groups.len());
        for group in groups {
            subscriptions.push(self.run_group(group).await?);
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            subscriptions,
        };
        let counts = summary.counts();
        info!(
            completed = counts.completed,
            failed = counts.failed,
            skipped = counts.skipped,
            timed_out = counts.timed_out,
            "Repair run finished"
        );
        Ok(summary)
    }

    async fn run_group(&self, group: SubscriptionGroup) -> Result<SubscriptionReport> {
        let name = group.subscription.as_str();

        enter(Phase::Authenticating, name);
        self.control_plane
            .authenticate(
                &self.credentials.principal,
                &self.credentials.secret,
                &self.credentials.tenant,
            )
            .await
            .with_context(|| format!("Failed to authenticate for subscription '{}'", name))?;

        enter(Phase::ResolvingSubscription, name);
        let subscription_id = self
            .control_plane
            .resolve_subscription_id(name)
            .await
            .with_context(|| format!("Failed to resolve subscription '{}'", name))?;

        enter(Phase::Dispatching, name);
        let mut pool = WorkerPool::new(
            Arc::clone(&self.control_plane),
            self.pool.clone(),
            Arc::clone(&self.repair),
        );
        let total = group.records.len();
        for record in group.records {
            pool.enqueue(record.resolve(subscription_id.as_str())).await;
        }
        info!(subscription = %name, targets = total, "All targets dispatched");

        enter(Phase::Draining, name);
        let records = pool.drain().await;

        enter(Phase::Finished, name);
        Ok(SubscriptionReport {
            subscription_name: group.subscription,
            subscription_id,
            records,
        })
    }
}

fn enter(phase: Phase, subscription: &str) {
    info!(subscription = %subscription, phase = %phase, "Subscription phase");
}
