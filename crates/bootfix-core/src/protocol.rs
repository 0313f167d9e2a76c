use crate::disk::DiskInfo;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPlaneErrorKind {
    /// The provider answered and refused (bad input, permission, conflict).
    Rejected,
    /// The call did not finish inside its command budget.
    TimedOut,
    /// The client could not be started at all.
    Launch,
    /// The provider answered with something we couldn't read.
    Parse,
    /// The caller stopped waiting.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ControlPlaneError {
    pub operation: &'static str,
    pub kind: ControlPlaneErrorKind,
    pub message: String,
}

impl ControlPlaneError {
    pub fn new(
        operation: &'static str,
        kind: ControlPlaneErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
        }
    }

    pub fn rejected(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(operation, ControlPlaneErrorKind::Rejected, message)
    }

    pub fn cancelled(operation: &'static str) -> Self {
        Self::new(
            operation,
            ControlPlaneErrorKind::Cancelled,
            "cancelled before completion",
        )
    }
}

impl fmt::Display for ControlPlaneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.message)
    }
}

impl std::error::Error for ControlPlaneError {}

pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;

pub type CallFuture<'a, T> = Pin<Box<dyn Future<Output = ControlPlaneResult<T>> + Send + 'a>>;

/// Cloud control-plane operations the repair flow depends on.
///
/// Every call is a slow remote operation that may fail. Implementations
/// hold no per-target state and are shared across concurrent workers.
pub trait ControlPlane: Send + Sync {
    fn get_power_state<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
    ) -> CallFuture<'a, String>;

    fn get_agent_status<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
    ) -> CallFuture<'a, String>;

    fn get_os_disk_name<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
    ) -> CallFuture<'a, String>;

    fn list_disks<'a>(&'a self, resource_group: &'a str) -> CallFuture<'a, Vec<DiskInfo>>;

    fn deallocate_vm<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
    ) -> CallFuture<'a, ()>;

    /// With `wait == false` the call returns once the start is accepted.
    fn start_vm<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
        wait: bool,
    ) -> CallFuture<'a, ()>;

    fn update_os_disk<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
        disk_id: &'a str,
    ) -> CallFuture<'a, ()>;

    fn create_repair_vm<'a>(&'a self, request: &'a RepairVmRequest) -> CallFuture<'a, ()>;

    fn run_repair_script<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
        repair_vm_id: &'a str,
        script_id: &'a str,
    ) -> CallFuture<'a, ()>;

    fn restore_repaired_disk<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
        repair_vm_id: &'a str,
    ) -> CallFuture<'a, ()>;

    fn authenticate<'a>(
        &'a self,
        principal: &'a str,
        secret: &'a str,
        tenant: &'a str,
    ) -> CallFuture<'a, ()>;

    fn resolve_subscription_id<'a>(&'a self, subscription_name: &'a str) -> CallFuture<'a, String>;
}

/// Arguments to `ControlPlane::create_repair_vm`.
#[derive(Clone)]
pub struct RepairVmRequest {
    pub resource_group: String,
    pub vm_name: String,
    pub repair_group: String,
    pub repair_vm_name: String,
    pub admin_user: String,
    pub admin_password: String,
}

impl fmt::Debug for RepairVmRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepairVmRequest")
            .field("resource_group", &self.resource_group)
            .field("vm_name", &self.vm_name)
            .field("repair_group", &self.repair_group)
            .field("repair_vm_name", &self.repair_vm_name)
            .field("admin_user", &self.admin_user)
            .field("admin_password", &"<redacted>")
            .finish()
    }
}

/// Power states that count as "running".
pub fn is_running_power_state(state: &str) -> bool {
    matches!(
        state.trim().to_ascii_lowercase().as_str(),
        "vm running" | "powerstate/running" | "running"
    )
}

/// Agent status reported by a healthy guest.
pub fn is_healthy_agent_status(status: &str) -> bool {
    status.trim().eq_ignore_ascii_case("ready")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_power_states() {
        assert!(is_running_power_state("VM running"));
        assert!(is_running_power_state("PowerState/running"));
        assert!(!is_running_power_state("VM deallocated"));
        assert!(!is_running_power_state("VM stopped"));
        assert!(!is_running_power_state(""));
    }

    #[test]
    fn test_agent_status() {
        assert!(is_healthy_agent_status("Ready"));
        assert!(is_healthy_agent_status("ready "));
        assert!(!is_healthy_agent_status("Not Ready"));
        assert!(!is_healthy_agent_status("Unresponsive"));
    }

    #[test]
    fn test_error_display_names_operation() {
        let err = ControlPlaneError::rejected("vm deallocate", "AuthorizationFailed");
        assert_eq!(err.to_string(), "vm deallocate failed: AuthorizationFailed");
        assert_eq!(err.kind, ControlPlaneErrorKind::Rejected);
    }

    #[test]
    fn test_repair_request_debug_redacts_password() {
        let request = RepairVmRequest {
            resource_group: "rg1".into(),
            vm_name: "vm1".into(),
            repair_group: "repair-x-rg".into(),
            repair_vm_name: "repairx".into(),
            admin_user: "repairadmin".into(),
            admin_password: "hunter2!".into(),
        };
        assert!(!format!("{:?}", request).contains("hunter2!"));
    }
}
