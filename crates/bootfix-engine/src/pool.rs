//! Bounded worker pool for one subscription batch.
//!
//! The pool is the only writer of job bookkeeping. Workers never touch it;
//! each one publishes its own outcome on a channel that the poll loop
//! drains. Every poll also checks running jobs against the timeout budget,
//! so a hung worker is cancelled within one poll interval of expiring.

use crate::monitor::TimeoutMonitor;
use crate::repair::{RepairMachine, RepairRun};
use crate::settings::{PoolSettings, RepairSettings};
use bootfix_core::{ControlPlane, JobId, JobRecord, JobState, RepairOutcome, RepairStep, Target};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Scheduler-side handle for one target.
struct Job {
    id: JobId,
    target: Arc<Target>,
    state: JobState,
    started_at: Option<Instant>,
    started_wall: Option<DateTime<Utc>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Job {
    fn queued(id: JobId, target: Target) -> Self {
        Self {
            id,
            target: Arc::new(target),
            state: JobState::Queued,
            started_at: None,
            started_wall: None,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }
}

/// What a worker publishes when its state machine finishes.
struct WorkerReport {
    job_id: JobId,
    run: RepairRun,
}

pub struct WorkerPool {
    settings: PoolSettings,
    repair: Arc<RepairSettings>,
    control_plane: Arc<dyn ControlPlane>,
    monitor: TimeoutMonitor,
    jobs: BTreeMap<JobId, Job>,
    next_id: u64,
    results_tx: mpsc::UnboundedSender<WorkerReport>,
    results_rx: mpsc::UnboundedReceiver<WorkerReport>,
    reaped: Vec<JobRecord>,
    ticks: u64,
    peak_running: usize,
}

impl WorkerPool {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        settings: PoolSettings,
        repair: Arc<RepairSettings>,
    ) -> Self {
        let settings = settings.sanitized();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            monitor: TimeoutMonitor::new(settings.job_timeout),
            settings,
            repair,
            control_plane,
            jobs: BTreeMap::new(),
            next_id: 0,
            results_tx,
            results_rx,
            reaped: Vec::new(),
            ticks: 0,
            peak_running: 0,
        }
    }

    pub fn running_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| job.state == JobState::Running)
            .count()
    }

    /// Jobs not yet reaped.
    pub fn pending_count(&self) -> usize {
        self.jobs.len()
    }

    /// Highest number of simultaneously running jobs seen so far.
    pub fn peak_running(&self) -> usize {
        self.peak_running
    }

    /// Queue `target` and start it as soon as a slot is free.
    ///
    /// Waits (polling, reaping and enforcing timeouts meanwhile) while the
    /// pool is at capacity.
    pub async fn enqueue(&mut self, target: Target) -> JobId {
        self.next_id += 1;
        let id = JobId(self.next_id);
        debug!(job_id = %id, target = %target, "Job queued");
        self.jobs.insert(id, Job::queued(id, target));

        loop {
            self.poll();
            if self.running_count() < self.settings.max_concurrent_jobs {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }

        self.dispatch(id);
        id
    }

    /// Wait until every enqueued job is terminal and return the records in
    /// the order they were reaped.
    pub async fn drain(mut self) -> Vec<JobRecord> {
        loop {
            self.poll();
            if self.jobs.is_empty() {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
        info!(
            jobs = self.reaped.len(),
            peak_running = self.peak_running,
            "Batch drained"
        );
        self.reaped
    }

    fn dispatch(&mut self, id: JobId) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        if let Err((from, to)) = job.state.transition(JobState::Running) {
            error!(job_id = %id, %from, %to, "Refusing job state transition");
            return;
        }
        job.started_at = Some(Instant::now());
        job.started_wall = Some(Utc::now());

        let span = tracing::info_span!(
            "repair",
            job_id = %id,
            subscription = %job.target.subscription_name(),
            resource_group = %job.target.resource_group(),
            vm = %job.target.vm_name()
        );
        let control_plane = Arc::clone(&self.control_plane);
        let repair = Arc::clone(&self.repair);
        let target = Arc::clone(&job.target);
        let cancel = job.cancel.clone();
        let tx = self.results_tx.clone();

        job.handle = Some(tokio::spawn(
            async move {
                info!("Repair started");
                let machine = RepairMachine::new(control_plane.as_ref(), &repair, cancel);
                let run = match AssertUnwindSafe(machine.run(&target)).catch_unwind().await {
                    Ok(run) => run,
                    Err(panic) => RepairRun::crashed(panic_detail(panic.as_ref())),
                };
                // Receiver gone means the pool was dropped; nobody is waiting.
                let _ = tx.send(WorkerReport { job_id: id, run });
            }
            .instrument(span),
        ));

        let running = self.running_count();
        self.peak_running = self.peak_running.max(running);
    }

    /// One pass of the poll loop: reap finished workers, then time out hung ones.
    fn poll(&mut self) {
        self.ticks += 1;
        self.reap_finished();
        self.enforce_timeouts();

        if self.ticks % self.settings.progress_every_ticks == 0 && !self.jobs.is_empty() {
            info!(
                running = self.running_count(),
                pending = self.jobs.len(),
                reaped = self.reaped.len(),
                "Waiting on repair jobs"
            );
        }
    }

    fn reap_finished(&mut self) {
        while let Ok(report) = self.results_rx.try_recv() {
            let still_running = self
                .jobs
                .get(&report.job_id)
                .is_some_and(|job| job.state == JobState::Running);
            if !still_running {
                debug!(job_id = %report.job_id, "Ignoring late report from a finished job");
                continue;
            }
            self.finish(report.job_id, report.run.outcome, report.run.steps);
        }
    }

    fn enforce_timeouts(&mut self) {
        let running = self.jobs.values().filter_map(|job| match job.state {
            JobState::Running => job.started_at.map(|at| (job.id, at)),
            _ => None,
        });
        let expired = self.monitor.expired(running, Instant::now());

        for id in expired {
            if let Some(job) = self.jobs.get_mut(&id) {
                warn!(
                    job_id = %id,
                    target = %job.target,
                    timeout_secs = self.monitor.job_timeout().as_secs(),
                    "Job exceeded its time budget; cancelling"
                );
                job.cancel.cancel();
                if let Some(handle) = job.handle.take() {
                    handle.abort();
                }
            }
            self.finish(id, RepairOutcome::TimedOut, Vec::new());
        }
    }

    fn finish(&mut self, id: JobId, outcome: RepairOutcome, steps: Vec<RepairStep>) {
        let Some(mut job) = self.jobs.remove(&id) else {
            return;
        };
        if let Err((from, to)) = job.state.transition(outcome.job_state()) {
            error!(job_id = %id, %from, %to, "Refusing job state transition");
            return;
        }

        let target = Arc::unwrap_or_clone(job.target);
        match &outcome {
            RepairOutcome::Completed | RepairOutcome::Skipped(_) => {
                info!(job_id = %id, target = %target, "{}", outcome)
            }
            RepairOutcome::Failed(_) | RepairOutcome::TimedOut => {
                warn!(job_id = %id, target = %target, "{}", outcome)
            }
        }

        let finished_at = Utc::now();
        self.reaped.push(JobRecord {
            job_id: id,
            target,
            state: job.state,
            outcome,
            steps,
            started_at: job.started_wall.unwrap_or(finished_at),
            finished_at,
        });
    }
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
