//! `ControlPlane` backed by the Azure CLI.
//!
//! Each call shells out to `az` on a blocking thread with a per-command
//! timeout. Dropping a call's future (for example when its job times out)
//! kills the child process, and everything it started, on the next wait poll.

use crate::util::{run_command_with_timeout, tail_chars};
use bootfix_core::{
    CallFuture, ControlPlane, ControlPlaneError, ControlPlaneErrorKind, ControlPlaneResult,
    DiskInfo, DiskState, RepairVmRequest,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const STDERR_TAIL_MAX_CHARS: usize = 2_000;

/// Flags whose following argument is a secret and must not be logged.
const SECRET_FLAGS: &[&str] = &["-p", "--password", "--repair-password"];

#[derive(Debug, Clone)]
pub struct AzCliControlPlane {
    program: String,
    /// Arguments placed before every `az` argument list.
    prefix_args: Vec<String>,
    command_timeout: Duration,
}

impl AzCliControlPlane {
    pub fn new(program: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            command_timeout,
        }
    }

    pub fn with_prefix_args(mut self, args: &[&str]) -> Self {
        self.prefix_args = args.iter().map(|s| s.to_string()).collect();
        self
    }

    fn env_overrides() -> [(&'static str, &'static str); 2] {
        [
            // `az vm repair` ships as an extension; install it without prompting.
            ("AZURE_EXTENSION_USE_DYNAMIC_INSTALL", "yes_without_prompt"),
            ("AZURE_CORE_ONLY_SHOW_ERRORS", "true"),
        ]
    }

    /// Run one `az` invocation and return its stdout.
    async fn run(&self, operation: &'static str, args: Vec<String>) -> ControlPlaneResult<String> {
        let abandon = Arc::new(AtomicBool::new(false));
        let _guard = AbandonOnDrop(Arc::clone(&abandon));

        let mut command = Command::new(&self.program);
        command.args(&self.prefix_args).args(&args);
        for (key, value) in Self::env_overrides() {
            command.env(key, value);
        }
        let timeout = self.command_timeout;
        debug!(operation, command = %redacted_command_line(&args), "Running az");

        let output = tokio::task::spawn_blocking(move || {
            run_command_with_timeout(&mut command, timeout, &abandon)
        })
        .await
        .map_err(|e| {
            ControlPlaneError::new(
                operation,
                ControlPlaneErrorKind::Launch,
                format!("command thread failed: {}", e),
            )
        })?
        .map_err(|e| ControlPlaneError::new(operation, ControlPlaneErrorKind::Launch, e))?;

        if output.abandoned {
            return Err(ControlPlaneError::cancelled(operation));
        }
        if output.timed_out {
            return Err(ControlPlaneError::new(
                operation,
                ControlPlaneErrorKind::TimedOut,
                format!("no answer after {}s", timeout.as_secs()),
            ));
        }
        if !output.success() {
            let detail = tail_chars(output.stderr.trim(), STDERR_TAIL_MAX_CHARS);
            let code = output
                .status
                .and_then(|s| s.code())
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(ControlPlaneError::rejected(
                operation,
                format!("exit {}: {}", code, detail),
            ));
        }
        debug!(operation, elapsed_ms = output.elapsed.as_millis() as u64, "az finished");
        Ok(output.stdout)
    }

    async fn run_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        args: Vec<String>,
    ) -> ControlPlaneResult<T> {
        let stdout = self.run(operation, args).await?;
        parse_json(operation, &stdout)
    }
}

/// Raises the abandon flag when the owning call future is dropped.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn redacted_command_line(args: &[String]) -> String {
    let mut out = Vec::with_capacity(args.len() + 1);
    out.push("az".to_string());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            out.push("***".to_string());
            hide_next = false;
            continue;
        }
        hide_next = SECRET_FLAGS.contains(&arg.as_str());
        out.push(arg.clone());
    }
    out.join(" ")
}

fn parse_json<T: DeserializeOwned>(operation: &'static str, stdout: &str) -> ControlPlaneResult<T> {
    serde_json::from_str(stdout).map_err(|e| {
        ControlPlaneError::new(
            operation,
            ControlPlaneErrorKind::Parse,
            format!("unexpected output ({}): {}", e, tail_chars(stdout.trim(), 200)),
        )
    })
}

// ---------------------------------------------------------------------------
// Output shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceViewEnvelope {
    instance_view: Option<InstanceView>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceView {
    #[serde(default)]
    statuses: Vec<InstanceStatus>,
    vm_agent: Option<VmAgent>,
}

#[derive(Debug, Deserialize)]
struct VmAgent {
    #[serde(default)]
    statuses: Vec<InstanceStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceStatus {
    code: Option<String>,
    display_status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmShow {
    storage_profile: StorageProfile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageProfile {
    os_disk: OsDisk,
}

#[derive(Debug, Deserialize)]
struct OsDisk {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiskListing {
    name: String,
    id: String,
    #[serde(default)]
    disk_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Account {
    id: String,
}

fn power_state_from(envelope: InstanceViewEnvelope) -> String {
    envelope
        .instance_view
        .unwrap_or_default()
        .statuses
        .into_iter()
        .find(|s| {
            s.code
                .as_deref()
                .is_some_and(|code| code.starts_with("PowerState/"))
        })
        .and_then(|s| s.display_status)
        .unwrap_or_else(|| "unknown".to_string())
}

fn agent_status_from(envelope: InstanceViewEnvelope) -> String {
    envelope
        .instance_view
        .and_then(|view| view.vm_agent)
        .and_then(|agent| agent.statuses.into_iter().next())
        .and_then(|s| s.display_status)
        .unwrap_or_else(|| "Unknown".to_string())
}

fn disks_from(listing: Vec<DiskListing>) -> Vec<DiskInfo> {
    listing
        .into_iter()
        .map(|d| {
            let state = d
                .disk_state
                .as_deref()
                .map(DiskState::parse)
                .unwrap_or_else(|| DiskState::Other(String::new()));
            DiskInfo::new(d.name, d.id, state)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Argument lists
// ---------------------------------------------------------------------------

fn instance_view_args(rg: &str, vm: &str) -> Vec<String> {
    args(&["vm", "get-instance-view", "-g", rg, "-n", vm, "-o", "json"])
}

fn start_args(rg: &str, vm: &str, wait: bool) -> Vec<String> {
    let mut out = args(&["vm", "start", "-g", rg, "-n", vm]);
    if !wait {
        out.push("--no-wait".to_string());
    }
    out
}

fn repair_create_args(request: &RepairVmRequest) -> Vec<String> {
    args(&[
        "vm",
        "repair",
        "create",
        "-g",
        &request.resource_group,
        "-n",
        &request.vm_name,
        "--repair-group-name",
        &request.repair_group,
        "--repair-vm-name",
        &request.repair_vm_name,
        "--repair-username",
        &request.admin_user,
        "--repair-password",
        &request.admin_password,
        "--yes",
        "-o",
        "none",
    ])
}

fn repair_run_args(rg: &str, vm: &str, repair_vm_id: &str, script_id: &str) -> Vec<String> {
    args(&[
        "vm",
        "repair",
        "run",
        "-g",
        rg,
        "-n",
        vm,
        "--run-id",
        script_id,
        "--run-on-repair",
        "--repair-vm-id",
        repair_vm_id,
        "-o",
        "none",
    ])
}

fn login_args(principal: &str, secret: &str, tenant: &str) -> Vec<String> {
    args(&[
        "login",
        "--service-principal",
        "-u",
        principal,
        "-p",
        secret,
        "--tenant",
        tenant,
        "-o",
        "none",
    ])
}

impl ControlPlane for AzCliControlPlane {
    fn get_power_state<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
    ) -> CallFuture<'a, String> {
        Box::pin(async move {
            let view = self
                .run_json("vm get-instance-view", instance_view_args(resource_group, vm_name))
                .await?;
            Ok(power_state_from(view))
        })
    }

    fn get_agent_status<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
    ) -> CallFuture<'a, String> {
        Box::pin(async move {
            let view = self
                .run_json("vm get-instance-view", instance_view_args(resource_group, vm_name))
                .await?;
            Ok(agent_status_from(view))
        })
    }

    fn get_os_disk_name<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
    ) -> CallFuture<'a, String> {
        Box::pin(async move {
            let vm: VmShow = self
                .run_json(
                    "vm show",
                    args(&["vm", "show", "-g", resource_group, "-n", vm_name, "-o", "json"]),
                )
                .await?;
            Ok(vm.storage_profile.os_disk.name)
        })
    }

    fn list_disks<'a>(&'a self, resource_group: &'a str) -> CallFuture<'a, Vec<DiskInfo>> {
        Box::pin(async move {
            let listing: Vec<DiskListing> = self
                .run_json(
                    "disk list",
                    args(&["disk", "list", "-g", resource_group, "-o", "json"]),
                )
                .await?;
            Ok(disks_from(listing))
        })
    }

    fn deallocate_vm<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
    ) -> CallFuture<'a, ()> {
        Box::pin(async move {
            self.run(
                "vm deallocate",
                args(&["vm", "deallocate", "-g", resource_group, "-n", vm_name]),
            )
            .await
            .map(|_| ())
        })
    }

    fn start_vm<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
        wait: bool,
    ) -> CallFuture<'a, ()> {
        Box::pin(async move {
            self.run("vm start", start_args(resource_group, vm_name, wait))
                .await
                .map(|_| ())
        })
    }

    fn update_os_disk<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
        disk_id: &'a str,
    ) -> CallFuture<'a, ()> {
        Box::pin(async move {
            self.run(
                "vm update",
                args(&[
                    "vm", "update", "-g", resource_group, "-n", vm_name, "--os-disk", disk_id,
                    "-o", "none",
                ]),
            )
            .await
            .map(|_| ())
        })
    }

    fn create_repair_vm<'a>(&'a self, request: &'a RepairVmRequest) -> CallFuture<'a, ()> {
        Box::pin(async move {
            self.run("vm repair create", repair_create_args(request))
                .await
                .map(|_| ())
        })
    }

    fn run_repair_script<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
        repair_vm_id: &'a str,
        script_id: &'a str,
    ) -> CallFuture<'a, ()> {
        Box::pin(async move {
            self.run(
                "vm repair run",
                repair_run_args(resource_group, vm_name, repair_vm_id, script_id),
            )
            .await
            .map(|_| ())
        })
    }

    fn restore_repaired_disk<'a>(
        &'a self,
        resource_group: &'a str,
        vm_name: &'a str,
        repair_vm_id: &'a str,
    ) -> CallFuture<'a, ()> {
        Box::pin(async move {
            self.run(
                "vm repair restore",
                args(&[
                    "vm",
                    "repair",
                    "restore",
                    "-g",
                    resource_group,
                    "-n",
                    vm_name,
                    "--repair-vm-id",
                    repair_vm_id,
                    "--yes",
                    "-o",
                    "none",
                ]),
            )
            .await
            .map(|_| ())
        })
    }

    fn authenticate<'a>(
        &'a self,
        principal: &'a str,
        secret: &'a str,
        tenant: &'a str,
    ) -> CallFuture<'a, ()> {
        Box::pin(async move {
            self.run("login", login_args(principal, secret, tenant))
                .await
                .map(|_| ())
        })
    }

    fn resolve_subscription_id<'a>(&'a self, subscription_name: &'a str) -> CallFuture<'a, String> {
        Box::pin(async move {
            let account: Account = self
                .run_json(
                    "account show",
                    args(&["account", "show", "--subscription", subscription_name, "-o", "json"]),
                )
                .await?;
            // Later calls run against the CLI's active subscription.
            self.run(
                "account set",
                args(&["account", "set", "--subscription", &account.id]),
            )
            .await?;
            Ok(account.id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTANCE_VIEW: &str = r#"{
        "name": "vm1",
        "instanceView": {
            "statuses": [
                {"code": "ProvisioningState/succeeded", "displayStatus": "Provisioning succeeded"},
                {"code": "PowerState/running", "displayStatus": "VM running"}
            ],
            "vmAgent": {
                "vmAgentVersion": "Unknown",
                "statuses": [{"code": "ProvisioningState/Unavailable", "displayStatus": "Not Ready"}]
            }
        }
    }"#;

    #[test]
    fn test_instance_view_parsing() {
        let view: InstanceViewEnvelope = parse_json("test", INSTANCE_VIEW).unwrap();
        assert_eq!(power_state_from(view), "VM running");
        let view: InstanceViewEnvelope = parse_json("test", INSTANCE_VIEW).unwrap();
        assert_eq!(agent_status_from(view), "Not Ready");
    }

    #[test]
    fn test_instance_view_without_agent() {
        let view: InstanceViewEnvelope =
            parse_json("test", r#"{"instanceView": {"statuses": []}}"#).unwrap();
        assert_eq!(agent_status_from(view), "Unknown");
        let view: InstanceViewEnvelope = parse_json("test", r#"{}"#).unwrap();
        assert_eq!(power_state_from(view), "unknown");
    }

    #[test]
    fn test_disk_listing_parsing() {
        let json = r#"[
            {"name": "vm1-osdisk", "id": "/d/vm1-osdisk", "diskState": "Unattached"},
            {"name": "vm1-DiskCopy-x7f2a", "id": "/d/copy", "diskState": "Attached"},
            {"name": "legacy", "id": "/d/legacy"}
        ]"#;
        let listing: Vec<DiskListing> = parse_json("test", json).unwrap();
        let disks = disks_from(listing);
        assert_eq!(disks.len(), 3);
        assert_eq!(disks[0].disk_state, DiskState::Unattached);
        assert!(disks[1].is_attached());
        assert_eq!(disks[2].disk_state, DiskState::Other(String::new()));
    }

    #[test]
    fn test_bad_json_is_a_parse_error() {
        let err = parse_json::<VmShow>("vm show", "ERROR: not json").unwrap_err();
        assert_eq!(err.kind, ControlPlaneErrorKind::Parse);
        assert_eq!(err.operation, "vm show");
    }

    #[test]
    fn test_secrets_are_redacted_from_command_lines() {
        let request = RepairVmRequest {
            resource_group: "rg1".into(),
            vm_name: "vm1".into(),
            repair_group: "repair-ab12cd34-rg".into(),
            repair_vm_name: "repairab12cd34".into(),
            admin_user: "repairadmin".into(),
            admin_password: "Rp#topsecret9z".into(),
        };
        let line = redacted_command_line(&repair_create_args(&request));
        assert!(!line.contains("Rp#topsecret9z"));
        assert!(line.contains("--repair-password ***"));

        let line = redacted_command_line(&login_args("app", "client-secret", "tenant"));
        assert!(!line.contains("client-secret"));
        assert!(line.contains("-u app"));
    }

    #[test]
    fn test_start_args_no_wait() {
        assert!(start_args("rg", "vm", false).contains(&"--no-wait".to_string()));
        assert!(!start_args("rg", "vm", true).contains(&"--no-wait".to_string()));
    }

    #[test]
    fn test_repair_run_args() {
        let run = repair_run_args("rg1", "vm1", "/sub/repair", "win-crowdstrike-fix-bootloop");
        let joined = run.join(" ");
        assert!(joined.contains("--run-id win-crowdstrike-fix-bootloop"));
        assert!(joined.contains("--run-on-repair"));
        assert!(joined.contains("--repair-vm-id /sub/repair"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_os_disk_name_through_a_stub_cli() {
        let cp = AzCliControlPlane::new("sh", Duration::from_secs(10)).with_prefix_args(&[
            "-c",
            r#"echo '{"storageProfile": {"osDisk": {"name": "vm1-DiskCopy-x7f2a"}}}'"#,
            "az",
        ]);
        let name = cp.get_os_disk_name("rg1", "vm1").await.unwrap();
        assert_eq!(name, "vm1-DiskCopy-x7f2a");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_a_rejection_with_stderr() {
        let cp = AzCliControlPlane::new("sh", Duration::from_secs(10)).with_prefix_args(&[
            "-c",
            "echo 'ERROR: (AuthorizationFailed) denied' >&2; exit 1",
            "az",
        ]);
        let err = cp.deallocate_vm("rg1", "vm1").await.unwrap_err();
        assert_eq!(err.kind, ControlPlaneErrorKind::Rejected);
        assert_eq!(err.operation, "vm deallocate");
        assert!(err.message.contains("AuthorizationFailed"));
        assert!(err.message.starts_with("exit 1"));
    }
}
