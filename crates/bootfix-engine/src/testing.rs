//! Scripted in-memory control plane.
//!
//! Records every call so tests can assert exact call sequences, and keeps
//! a little per-VM state so mutations are visible to later diagnostics.

use bootfix_core::{
    CallFuture, ControlPlane, ControlPlaneError, ControlPlaneResult, DiskInfo, DiskState,
    RepairVmRequest,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GetPowerState { vm: String },
    GetAgentStatus { vm: String },
    GetOsDiskName { vm: String },
    ListDisks { resource_group: String },
    DeallocateVm { vm: String },
    StartVm { vm: String, wait: bool },
    UpdateOsDisk { vm: String, disk_id: String },
    CreateRepairVm {
        vm: String,
        repair_group: String,
        repair_vm_name: String,
    },
    RunRepairScript {
        vm: String,
        repair_vm_id: String,
        script_id: String,
    },
    RestoreRepairedDisk { vm: String, repair_vm_id: String },
    Authenticate { principal: String, tenant: String },
    ResolveSubscriptionId { subscription: String },
}

impl Call {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::GetPowerState { .. } => "get_power_state",
            Self::GetAgentStatus { .. } => "get_agent_status",
            Self::GetOsDiskName { .. } => "get_os_disk_name",
            Self::ListDisks { .. } => "list_disks",
            Self::DeallocateVm { .. } => "deallocate_vm",
            Self::StartVm { .. } => "start_vm",
            Self::UpdateOsDisk { .. } => "update_os_disk",
            Self::CreateRepairVm { .. } => "create_repair_vm",
            Self::RunRepairScript { .. } => "run_repair_script",
            Self::RestoreRepairedDisk { .. } => "restore_repaired_disk",
            Self::Authenticate { .. } => "authenticate",
            Self::ResolveSubscriptionId { .. } => "resolve_subscription_id",
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::DeallocateVm { .. }
                | Self::StartVm { .. }
                | Self::UpdateOsDisk { .. }
                | Self::CreateRepairVm { .. }
                | Self::RunRepairScript { .. }
                | Self::RestoreRepairedDisk { .. }
        )
    }

    /// VM the call is about, if any.
    pub fn vm(&self) -> Option<&str> {
        match self {
            Self::GetPowerState { vm }
            | Self::GetAgentStatus { vm }
            | Self::GetOsDiskName { vm }
            | Self::DeallocateVm { vm }
            | Self::StartVm { vm, .. }
            | Self::UpdateOsDisk { vm, .. }
            | Self::CreateRepairVm { vm, .. }
            | Self::RunRepairScript { vm, .. }
            | Self::RestoreRepairedDisk { vm, .. } => Some(vm),
            _ => None,
        }
    }
}

/// Scripted state of one fake machine.
#[derive(Debug, Clone)]
pub struct FakeVm {
    pub power_state: String,
    pub agent_status: String,
    pub os_disk_name: String,
    pub disks: Vec<DiskInfo>,
    failing: HashSet<&'static str>,
    hanging: HashSet<&'static str>,
    panicking: HashSet<&'static str>,
}

impl FakeVm {
    /// Running, agent unresponsive, already on its original disk.
    pub fn broken(vm_name: &str) -> Self {
        let original = format!("{}-osdisk", vm_name);
        Self {
            power_state: "VM running".to_string(),
            agent_status: "Unresponsive".to_string(),
            os_disk_name: original.clone(),
            disks: vec![DiskInfo::new(
                original.clone(),
                disk_id(&original),
                DiskState::Attached,
            )],
            failing: HashSet::new(),
            hanging: HashSet::new(),
            panicking: HashSet::new(),
        }
    }

    /// Running, agent unresponsive, booted from `<vm>-DiskCopy-x7f2a` with the
    /// original disk sitting unattached.
    pub fn on_disk_copy(vm_name: &str) -> Self {
        let original = format!("{}-osdisk", vm_name);
        let copy = format!("{}-DiskCopy-x7f2a", vm_name);
        Self {
            os_disk_name: copy.clone(),
            disks: vec![
                DiskInfo::new(original.clone(), disk_id(&original), DiskState::Unattached),
                DiskInfo::new(copy.clone(), disk_id(&copy), DiskState::Attached),
            ],
            ..Self::broken(vm_name)
        }
    }

    pub fn with_power_state(mut self, state: &str) -> Self {
        self.power_state = state.to_string();
        self
    }

    pub fn with_agent_status(mut self, status: &str) -> Self {
        self.agent_status = status.to_string();
        self
    }

    pub fn with_disks(mut self, disks: Vec<DiskInfo>) -> Self {
        self.disks = disks;
        self
    }

    /// Make `operation` (see [`Call::operation`]) return a rejection.
    pub fn failing(mut self, operation: &'static str) -> Self {
        self.failing.insert(operation);
        self
    }

    /// Make `operation` never return.
    pub fn hanging(mut self, operation: &'static str) -> Self {
        self.hanging.insert(operation);
        self
    }

    /// Make `operation` panic inside the calling task.
    pub fn panicking(mut self, operation: &'static str) -> Self {
        self.panicking.insert(operation);
        self
    }
}

pub fn disk_id(name: &str) -> String {
    format!(
        "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/disks/{}",
        name
    )
}

#[derive(Default)]
pub struct FakeControlPlane {
    vms: Mutex<HashMap<String, FakeVm>>,
    subscriptions: HashMap<String, String>,
    reject_auth: bool,
    call_delay: Duration,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vm(self, vm_name: &str, vm: FakeVm) -> Self {
        lock(&self.vms).insert(vm_name.to_string(), vm);
        self
    }

    pub fn with_subscription(mut self, name: &str, id: &str) -> Self {
        self.subscriptions.insert(name.to_string(), id.to_string());
        self
    }

    pub fn rejecting_auth(mut self) -> Self {
        self.reject_auth = true;
        self
    }

    /// Every call sleeps this long before answering.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, vm_name: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.vm() == Some(vm_name))
            .collect()
    }

    pub fn operations_for(&self, vm_name: &str) -> Vec<&'static str> {
        self.calls_for(vm_name).iter().map(Call::operation).collect()
    }

    /// Highest number of calls that were awaiting an answer at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn vm(&self, vm_name: &str) -> Option<FakeVm> {
        lock(&self.vms).get(vm_name).cloned()
    }

    async fn respond<T, F>(&self, call: Call, answer: F) -> ControlPlaneResult<T>
    where
        F: FnOnce(Option<&mut FakeVm>) -> ControlPlaneResult<T> + Send,
    {
        let operation = call.operation();
        let vm_name = call.vm().map(str::to_string);
        lock(&self.calls).push(call);
        let _in_flight = InFlight::enter(&self.in_flight, &self.peak_in_flight);

        let (hang, fail, panic) = {
            let vms = lock(&self.vms);
            vm_name
                .as_deref()
                .and_then(|name| vms.get(name))
                .map(|vm| {
                    (
                        vm.hanging.contains(operation),
                        vm.failing.contains(operation),
                        vm.panicking.contains(operation),
                    )
                })
                .unwrap_or((false, false, false))
        };

        if panic {
            panic!("scripted panic in {}", operation);
        }
        if hang {
            std::future::pending::<()>().await;
        }
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        if fail {
            return Err(ControlPlaneError::rejected(operation, "scripted failure"));
        }

        let mut vms = lock(&self.vms);
        answer(vm_name.as_deref().and_then(|name| vms.get_mut(name)))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn not_found(operation: &'static str) -> ControlPlaneError {
    ControlPlaneError::rejected(operation, "ResourceNotFound")
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ControlPlane for FakeControlPlane {
    fn get_power_state<'a>(
        &'a self,
        _resource_group: &'a str,
        vm_name: &'a str,
    ) -> CallFuture<'a, String> {
        Box::pin(self.respond(
            Call::GetPowerState {
                vm: vm_name.to_string(),
            },
            |vm| {
                vm.map(|vm| vm.power_state.clone())
                    .ok_or_else(|| not_found("get_power_state"))
            },
        ))
    }

    fn get_agent_status<'a>(
        &'a self,
        _resource_group: &'a str,
        vm_name: &'a str,
    ) -> CallFuture<'a, String> {
        Box::pin(self.respond(
            Call::GetAgentStatus {
                vm: vm_name.to_string(),
            },
            |vm| {
                vm.map(|vm| vm.agent_status.clone())
                    .ok_or_else(|| not_found("get_agent_status"))
            },
        ))
    }

    fn get_os_disk_name<'a>(
        &'a self,
        _resource_group: &'a str,
        vm_name: &'a str,
    ) -> CallFuture<'a, String> {
        Box::pin(self.respond(
            Call::GetOsDiskName {
                vm: vm_name.to_string(),
            },
            |vm| {
                vm.map(|vm| vm.os_disk_name.clone())
                    .ok_or_else(|| not_found("get_os_disk_name"))
            },
        ))
    }

    fn list_disks<'a>(&'a self, resource_group: &'a str) -> CallFuture<'a, Vec<DiskInfo>> {
        Box::pin(async move {
            let listed = self
                .respond(
                    Call::ListDisks {
                        resource_group: resource_group.to_string(),
                    },
                    |_| Ok(()),
                )
                .await;
            listed.map(|()| {
                lock(&self.vms)
                    .values()
                    .flat_map(|vm| vm.disks.iter().cloned())
                    .collect()
            })
        })
    }

    fn deallocate_vm<'a>(
        &'a self,
        _resource_group: &'a str,
        vm_name: &'a str,
    ) -> CallFuture<'a, ()> {
        Box::pin(self.respond(
            Call::DeallocateVm {
                vm: vm_name.to_string(),
            },
            |vm| {
                let vm = vm.ok_or_else(|| not_found("deallocate_vm"))?;
                vm.power_state = "VM deallocated".to_string();
                Ok(())
            },
        ))
    }

    fn start_vm<'a>(
        &'a self,
        _resource_group: &'a str,
        vm_name: &'a str,
        wait: bool,
    ) -> CallFuture<'a, ()> {
        Box::pin(self.respond(
            Call::StartVm {
                vm: vm_name.to_string(),
                wait,
            },
            |vm| {
                let vm = vm.ok_or_else(|| not_found("start_vm"))?;
                vm.power_state = "VM running".to_string();
                Ok(())
            },
        ))
    }

    fn update_os_disk<'a>(
        &'a self,
        _resource_group: &'a str,
        vm_name: &'a str,
        disk_id: &'a str,
    ) -> CallFuture<'a, ()> {
        Box::pin(self.respond(
            Call::UpdateOsDisk {
                vm: vm_name.to_string(),
                disk_id: disk_id.to_string(),
            },
            move |vm| {
                let vm = vm.ok_or_else(|| not_found("update_os_disk"))?;
                let previous = vm.os_disk_name.clone();
                for disk in vm.disks.iter_mut() {
                    if disk.id == disk_id {
                        disk.disk_state = DiskState::Attached;
                        vm.os_disk_name = disk.name.clone();
                    } else if disk.name == previous {
                        disk.disk_state = DiskState::Unattached;
                    }
                }
                Ok(())
            },
        ))
    }

    fn create_repair_vm<'a>(&'a self, request: &'a RepairVmRequest) -> CallFuture<'a, ()> {
        Box::pin(self.respond(
            Call::CreateRepairVm {
                vm: request.vm_name.clone(),
                repair_group: request.repair_group.clone(),
                repair_vm_name: request.repair_vm_name.clone(),
            },
            |vm| vm.map(|_| ()).ok_or_else(|| not_found("create_repair_vm")),
        ))
    }

    fn run_repair_script<'a>(
        &'a self,
        _resource_group: &'a str,
        vm_name: &'a str,
        repair_vm_id: &'a str,
        script_id: &'a str,
    ) -> CallFuture<'a, ()> {
        Box::pin(self.respond(
            Call::RunRepairScript {
                vm: vm_name.to_string(),
                repair_vm_id: repair_vm_id.to_string(),
                script_id: script_id.to_string(),
            },
            |vm| vm.map(|_| ()).ok_or_else(|| not_found("run_repair_script")),
        ))
    }

    fn restore_repaired_disk<'a>(
        &'a self,
        _resource_group: &'a str,
        vm_name: &'a str,
        repair_vm_id: &'a str,
    ) -> CallFuture<'a, ()> {
        Box::pin(self.respond(
            Call::RestoreRepairedDisk {
                vm: vm_name.to_string(),
                repair_vm_id: repair_vm_id.to_string(),
            },
            |vm| {
                let vm = vm.ok_or_else(|| not_found("restore_repaired_disk"))?;
                vm.agent_status = "Ready".to_string();
                Ok(())
            },
        ))
    }

    fn authenticate<'a>(
        &'a self,
        principal: &'a str,
        _secret: &'a str,
        tenant: &'a str,
    ) -> CallFuture<'a, ()> {
        let rejected = self.reject_auth;
        Box::pin(self.respond(
            Call::Authenticate {
                principal: principal.to_string(),
                tenant: tenant.to_string(),
            },
            move |_| {
                if rejected {
                    Err(ControlPlaneError::rejected(
                        "authenticate",
                        "AADSTS7000215: invalid client secret",
                    ))
                } else {
                    Ok(())
                }
            },
        ))
    }

    fn resolve_subscription_id<'a>(&'a self, subscription_name: &'a str) -> CallFuture<'a, String> {
        let resolved = self.subscriptions.get(subscription_name).cloned();
        Box::pin(self.respond(
            Call::ResolveSubscriptionId {
                subscription: subscription_name.to_string(),
            },
            move |_| {
                resolved.ok_or_else(|| {
                    ControlPlaneError::rejected("resolve_subscription_id", "SubscriptionNotFound")
                })
            },
        ))
    }
}
