//! Per-target repair state machine.
//!
//! Drives one target from diagnosis to a terminal outcome using only the
//! [`ControlPlane`] contract. Cheap read-only checks run first so the
//! common "nothing to do" case never touches a mutating call.
//!
//! There is no multi-step rollback. A failure while creating the repair VM,
//! running the script, or restoring the disk leaves the repair resources in
//! place for manual inspection.

use crate::settings::RepairSettings;
use bootfix_core::disk::{is_disk_copy, original_disk_name};
use bootfix_core::{
    is_healthy_agent_status, is_running_power_state, CallFuture, ControlPlane,
    ControlPlaneError, FailureReason, RepairOutcome, RepairSession, RepairStep, RepairVmRequest,
    SkipReason, Target,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one state machine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRun {
    pub outcome: RepairOutcome,
    pub steps: Vec<RepairStep>,
}

impl RepairRun {
    pub fn crashed(detail: impl Into<String>) -> Self {
        Self {
            outcome: RepairOutcome::Failed(FailureReason::WorkerCrashed(detail.into())),
            steps: Vec::new(),
        }
    }
}

/// A remote call failed inside `step`.
struct StepFailure {
    step: RepairStep,
    error: ControlPlaneError,
}

type StepResult<T> = Result<T, StepFailure>;

pub struct RepairMachine<'a> {
    control_plane: &'a dyn ControlPlane,
    settings: &'a RepairSettings,
    cancel: CancellationToken,
    steps: Vec<RepairStep>,
}

impl<'a> RepairMachine<'a> {
    pub fn new(
        control_plane: &'a dyn ControlPlane,
        settings: &'a RepairSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            control_plane,
            settings,
            cancel,
            steps: Vec::new(),
        }
    }

    pub async fn run(mut self, target: &Target) -> RepairRun {
        let outcome = match self.drive(target).await {
            Ok(outcome) => outcome,
            Err(StepFailure { step, error }) => {
                warn!(step = %step, error = %error, "Repair step failed");
                RepairOutcome::Failed(FailureReason::ControlPlane {
                    step,
                    message: error.message,
                })
            }
        };
        RepairRun {
            outcome,
            steps: self.steps,
        }
    }

    async fn drive(&mut self, target: &Target) -> StepResult<RepairOutcome> {
        // One session per attempt. A retried target gets fresh names and password.
        let mut session = RepairSession::new();
        let cp = self.control_plane;
        let rg = target.resource_group();
        let vm = target.vm_name();

        self.enter(RepairStep::DiagnosePower);
        let power = self
            .call(RepairStep::DiagnosePower, cp.get_power_state(rg, vm))
            .await?;
        if !is_running_power_state(&power) {
            debug!(power_state = %power, "Target is not running");
            return Ok(RepairOutcome::Skipped(SkipReason::NotRunning));
        }

        self.enter(RepairStep::DiagnoseAgent);
        let agent = self
            .call(RepairStep::DiagnoseAgent, cp.get_agent_status(rg, vm))
            .await?;
        if is_healthy_agent_status(&agent) {
            return Ok(RepairOutcome::Skipped(SkipReason::AlreadyHealthy));
        }
        debug!(agent_status = %agent, "Guest agent unhealthy");

        self.enter(RepairStep::DiagnoseDisk);
        let os_disk = self
            .call(RepairStep::DiagnoseDisk, cp.get_os_disk_name(rg, vm))
            .await?;
        if is_disk_copy(&os_disk) {
            if let Some(failure) = self.swap_disk(target, &os_disk).await? {
                return Ok(RepairOutcome::Failed(failure));
            }
        } else {
            debug!(os_disk = %os_disk, "OS disk is not a copy; no swap needed");
        }

        self.enter(RepairStep::CreateRepairVm);
        let request = RepairVmRequest {
            resource_group: rg.to_string(),
            vm_name: vm.to_string(),
            repair_group: session.repair_resource_group_name(),
            repair_vm_name: session.repair_vm_name(),
            admin_user: self.settings.admin_user.clone(),
            admin_password: session.admin_password().to_string(),
        };
        self.call(RepairStep::CreateRepairVm, cp.create_repair_vm(&request))
            .await?;
        let repair_vm_id = session
            .record_repair_vm(target.subscription_id())
            .to_string();
        info!(
            repair_vm = %request.repair_vm_name,
            repair_group = %request.repair_group,
            "Repair VM created"
        );

        self.enter(RepairStep::RunRepairScript);
        self.call(
            RepairStep::RunRepairScript,
            cp.run_repair_script(rg, vm, &repair_vm_id, &self.settings.script_id),
        )
        .await?;

        self.enter(RepairStep::RestoreDisk);
        self.call(
            RepairStep::RestoreDisk,
            cp.restore_repaired_disk(rg, vm, &repair_vm_id),
        )
        .await?;

        Ok(RepairOutcome::Completed)
    }

    /// Put the machine back on its original OS disk.
    ///
    /// Returns `Some(reason)` when the swap had to be abandoned.
    async fn swap_disk(
        &mut self,
        target: &Target,
        copy_disk: &str,
    ) -> StepResult<Option<FailureReason>> {
        let cp = self.control_plane;
        let rg = target.resource_group();
        let vm = target.vm_name();
        let step = RepairStep::SwapDisk;
        self.enter(step);

        let wanted = original_disk_name(vm);
        let disks = self.call(step, cp.list_disks(rg)).await?;
        let Some(original) = disks
            .into_iter()
            .find(|d| d.name.eq_ignore_ascii_case(&wanted))
        else {
            warn!(expected = %wanted, "Original OS disk not found");
            return Ok(Some(FailureReason::OriginalDiskNotFound));
        };

        info!(from = %copy_disk, to = %original.name, "Swapping OS disk back to original");
        self.call(step, cp.deallocate_vm(rg, vm)).await?;

        if original.is_attached() {
            warn!(
                disk = %original.name,
                "Original disk is attached elsewhere; restarting target and giving up"
            );
            if let Err(err) = self.call(step, cp.start_vm(rg, vm, false)).await {
                warn!(error = %err.error, "Best-effort restart after disk conflict failed");
            }
            return Ok(Some(FailureReason::DiskConflict));
        }

        self.call(step, cp.update_os_disk(rg, vm, &original.id))
            .await?;
        self.call(step, cp.start_vm(rg, vm, false)).await?;
        // The agent will not be up yet; only give the boot a head start.
        self.pause(step, self.settings.swap_grace).await?;
        Ok(None)
    }

    fn enter(&mut self, step: RepairStep) {
        debug!(step = %step, "Entering step");
        self.steps.push(step);
    }

    async fn call<T>(&self, step: RepairStep, fut: CallFuture<'_, T>) -> StepResult<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StepFailure {
                step,
                error: ControlPlaneError::cancelled(step.label()),
            }),
            result = fut => result.map_err(|error| StepFailure { step, error }),
        }
    }

    async fn pause(&self, step: RepairStep, duration: std::time::Duration) -> StepResult<()> {
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StepFailure {
                step,
                error: ControlPlaneError::cancelled(step.label()),
            }),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
