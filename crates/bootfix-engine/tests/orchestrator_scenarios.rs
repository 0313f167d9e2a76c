use bootfix_core::{
    Credentials, DiskInfo, DiskState, FailureReason, JobState, RepairOutcome, SkipReason,
    TargetRecord,
};
use bootfix_engine::testing::{disk_id, Call, FakeControlPlane, FakeVm};
use bootfix_engine::{Orchestrator, PoolSettings, RepairSettings};
use std::sync::Arc;
use std::time::Duration;

fn orchestrator(cp: Arc<FakeControlPlane>, max_jobs: usize) -> Orchestrator {
    Orchestrator::new(
        cp,
        Credentials::new("app-id", "secret", "tenant-id"),
        PoolSettings {
            max_concurrent_jobs: max_jobs,
            job_timeout: Duration::from_secs(70 * 60),
            poll_interval: Duration::from_secs(1),
            progress_every_ticks: 30,
        },
        RepairSettings {
            swap_grace: Duration::ZERO,
            ..RepairSettings::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_disk_copy_target_runs_full_repair() {
    let cp = Arc::new(
        FakeControlPlane::new()
            .with_subscription("A", "sub-a")
            .with_vm("vm1", FakeVm::on_disk_copy("vm1")),
    );

    let summary = orchestrator(Arc::clone(&cp), 20)
        .run(vec![TargetRecord::new("A", "rg1", "vm1")])
        .await
        .unwrap();

    let records: Vec<_> = summary.records().collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, RepairOutcome::Completed);
    assert_eq!(records[0].target.subscription_id(), "sub-a");
    assert_eq!(
        cp.operations_for("vm1"),
        vec![
            "get_power_state",
            "get_agent_status",
            "get_os_disk_name",
            "deallocate_vm",
            "update_os_disk",
            "start_vm",
            "create_repair_vm",
            "run_repair_script",
            "restore_repaired_disk",
        ]
    );
    assert_eq!(summary.subscriptions[0].subscription_id, "sub-a");
}

#[tokio::test(start_paused = true)]
async fn test_disk_scenarios_report_their_reasons() {
    let cp = Arc::new(
        FakeControlPlane::new()
            .with_subscription("A", "sub-a")
            .with_vm(
                "missing",
                FakeVm::on_disk_copy("missing").with_disks(vec![DiskInfo::new(
                    "missing-DiskCopy-x7f2a",
                    disk_id("missing-DiskCopy-x7f2a"),
                    DiskState::Attached,
                )]),
            )
            .with_vm(
                "conflict",
                FakeVm::on_disk_copy("conflict").with_disks(vec![DiskInfo::new(
                    "conflict-osdisk",
                    disk_id("conflict-osdisk"),
                    DiskState::Attached,
                )]),
            ),
    );

    let summary = orchestrator(Arc::clone(&cp), 20)
        .run(vec![
            TargetRecord::new("A", "rg1", "missing"),
            TargetRecord::new("A", "rg2", "conflict"),
        ])
        .await
        .unwrap();

    let outcome_of = |vm: &str| {
        summary
            .records()
            .find(|r| r.target.vm_name() == vm)
            .map(|r| r.outcome.clone())
            .unwrap()
    };
    assert_eq!(
        outcome_of("missing"),
        RepairOutcome::Failed(FailureReason::OriginalDiskNotFound)
    );
    assert_eq!(
        outcome_of("conflict"),
        RepairOutcome::Failed(FailureReason::DiskConflict)
    );

    assert!(cp.calls_for("missing").iter().all(|c| !c.is_mutation()));
    let conflict_calls = cp.calls_for("conflict");
    assert!(conflict_calls.iter().any(|c| matches!(c, Call::StartVm { .. })));
    assert!(!conflict_calls
        .iter()
        .any(|c| matches!(c, Call::UpdateOsDisk { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_every_target_reaches_one_terminal_state() {
    let mut cp = FakeControlPlane::new()
        .with_subscription("A", "sub-a")
        .with_call_delay(Duration::from_secs(2));
    let mut records = Vec::new();
    for i in 0..25 {
        let vm = format!("vm{}", i);
        let fake = match i % 5 {
            0 => FakeVm::broken(&vm).with_power_state("VM deallocated"),
            1 => FakeVm::broken(&vm).with_agent_status("Ready"),
            2 => FakeVm::broken(&vm).failing("run_repair_script"),
            _ => FakeVm::broken(&vm),
        };
        cp = cp.with_vm(&vm, fake);
        records.push(TargetRecord::new("A", "rg1", vm));
    }
    let cp = Arc::new(cp);

    let summary = orchestrator(Arc::clone(&cp), 5).run(records).await.unwrap();

    assert!(cp.peak_in_flight() <= 5);
    let counts = summary.counts();
    assert_eq!(counts.total(), 25);
    assert_eq!(counts.skipped, 10);
    assert_eq!(counts.failed, 5);
    assert_eq!(counts.completed, 10);
    assert_eq!(counts.timed_out, 0);

    let mut vms: Vec<_> = summary
        .records()
        .map(|r| r.target.vm_name().to_string())
        .collect();
    vms.sort();
    vms.dedup();
    assert_eq!(vms.len(), 25);

    for record in summary.records() {
        assert!(record.state.is_terminal());
        if record.state == JobState::Skipped {
            assert!(matches!(
                record.outcome,
                RepairOutcome::Skipped(SkipReason::NotRunning | SkipReason::AlreadyHealthy)
            ));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_run_one_after_another() {
    let cp = Arc::new(
        FakeControlPlane::new()
            .with_subscription("A", "sub-a")
            .with_subscription("B", "sub-b")
            .with_call_delay(Duration::from_secs(1))
            .with_vm("a1", FakeVm::broken("a1"))
            .with_vm("a2", FakeVm::broken("a2"))
            .with_vm("b1", FakeVm::broken("b1")),
    );

    let summary = orchestrator(Arc::clone(&cp), 20)
        .run(vec![
            TargetRecord::new("B", "rg", "b1"),
            TargetRecord::new("A", "rg", "a1"),
            TargetRecord::new("A", "rg", "a2"),
        ])
        .await
        .unwrap();

    let names: Vec<_> = summary
        .subscriptions
        .iter()
        .map(|s| s.subscription_name.as_str())
        .collect();
    assert_eq!(names, vec!["A", "B"]);

    let calls = cp.calls();
    let resolve_b = calls
        .iter()
        .position(|c| {
            *c == Call::ResolveSubscriptionId {
                subscription: "B".to_string(),
            }
        })
        .unwrap();
    let last_a = calls
        .iter()
        .rposition(|c| matches!(c.vm(), Some("a1") | Some("a2")))
        .unwrap();
    let first_b = calls.iter().position(|c| c.vm() == Some("b1")).unwrap();
    assert!(last_a < resolve_b);
    assert!(resolve_b < first_b);

    let auths = calls
        .iter()
        .filter(|c| matches!(c, Call::Authenticate { .. }))
        .count();
    assert_eq!(auths, 2);
}

#[tokio::test(start_paused = true)]
async fn test_authentication_failure_is_fatal() {
    let cp = Arc::new(
        FakeControlPlane::new()
            .rejecting_auth()
            .with_subscription("A", "sub-a")
            .with_vm("vm1", FakeVm::broken("vm1")),
    );

    let err = orchestrator(Arc::clone(&cp), 20)
        .run(vec![TargetRecord::new("A", "rg1", "vm1")])
        .await
        .unwrap_err();

    assert!(err.to_string().contains("Failed to authenticate"));
    assert!(cp.calls_for("vm1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_subscription_is_fatal() {
    let cp = Arc::new(FakeControlPlane::new().with_vm("vm1", FakeVm::broken("vm1")));

    let err = orchestrator(Arc::clone(&cp), 20)
        .run(vec![TargetRecord::new("Missing", "rg1", "vm1")])
        .await
        .unwrap_err();

    assert!(err.to_string().contains("Failed to resolve subscription 'Missing'"));
    assert!(cp.calls_for("vm1").is_empty());
}
