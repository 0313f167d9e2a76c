//! bootfix - batch repair for cloud VMs stuck in a boot loop
//!
//! Reads a list of machines, groups them by subscription, and drives each
//! one through diagnosis and an offline disk repair with bounded
//! concurrency and a per-machine deadline.

use anyhow::{anyhow, Context, Result};
use bootfix_adapters::logging::{self, LoggingGuard};
use bootfix_adapters::{config::Config, keyring, load_targets, state};
use bootfix_adapters::{write_run_report, AzCliControlPlane, RunLock};
use bootfix_core::{Credentials, RunSummary};
use bootfix_engine::{group_by_subscription, Orchestrator, PoolSettings, RepairSettings};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "bootfix",
    about = "Batch repair for cloud VMs stuck in a boot loop",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file (defaults to ~/.config/bootfix/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Prompt for service principal credentials and store them
    #[arg(long)]
    store_credentials: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Repair every machine in the target list
    Run {
        targets: PathBuf,

        #[command(flatten)]
        overrides: Overrides,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,

        /// Don't write a run report to the state directory
        #[arg(long)]
        no_report: bool,
    },
    /// Show how the target list would be batched without touching any machine
    Plan { targets: PathBuf },
}

#[derive(ClapArgs, Debug, Default)]
struct Overrides {
    /// Maximum repairs in flight per subscription
    #[arg(long)]
    max_jobs: Option<usize>,

    /// Per-machine deadline in minutes
    #[arg(long)]
    timeout_minutes: Option<u64>,

    /// Repair script run on the repair VM
    #[arg(long)]
    script_id: Option<String>,

    /// Seconds between scheduler polls
    #[arg(long)]
    poll_seconds: Option<u64>,
}

impl Overrides {
    fn apply(&self, config: &mut Config) {
        if let Some(max_jobs) = self.max_jobs {
            config.max_concurrent_jobs = max_jobs.max(1);
        }
        if let Some(minutes) = self.timeout_minutes {
            config.job_timeout_minutes = minutes.max(1);
        }
        if let Some(script_id) = self.script_id.as_deref().map(str::trim) {
            if !script_id.is_empty() {
                config.repair_script_id = script_id.to_string();
            }
        }
        if let Some(seconds) = self.poll_seconds {
            config.poll_interval_seconds = seconds.max(1);
        }
    }
}

fn pool_settings(config: &Config) -> PoolSettings {
    PoolSettings {
        max_concurrent_jobs: config.max_concurrent_jobs,
        job_timeout: Duration::from_secs(config.job_timeout_minutes.saturating_mul(60)),
        poll_interval: Duration::from_secs(config.poll_interval_seconds),
        progress_every_ticks: config.progress_every_ticks,
    }
    .sanitized()
}

fn repair_settings(config: &Config) -> RepairSettings {
    RepairSettings {
        script_id: config.repair_script_id.clone(),
        admin_user: config.repair_admin_user.clone(),
        swap_grace: Duration::from_secs(config.swap_grace_seconds),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.store_credentials {
        return store_credentials_interactive();
    }

    let Some(command) = args.command else {
        return Err(anyhow!("Nothing to do. Try `bootfix run <targets>` or `bootfix --help`."));
    };

    match command {
        Command::Plan { targets } => {
            let _logging = logging::init_logging(
                &logging::default_log_dir(),
                logging::plan_log_file(),
                args.verbose,
            )
            .context("Failed to initialize logging")?;
            plan(&targets)
        }
        Command::Run {
            targets,
            overrides,
            json,
            no_report,
        } => {
            let state_dir = state::default_state_dir()
                .ok_or_else(|| anyhow!("Could not determine state directory"))?;
            let (_lock, _logging) =
                start_run(&state_dir, &logging::default_log_dir(), args.verbose)?;

            let mut config = load_config(args.config.as_deref());
            overrides.apply(&mut config);
            let summary = run(&config, &targets, &state_dir, !no_report).await?;
            print_summary(&summary, json)
        }
    }
}

/// Take the run lock, then start logging. A second run fails on the lock
/// before it can truncate the log of the run that holds it.
fn start_run(state_dir: &Path, log_dir: &Path, verbose: bool) -> Result<(RunLock, LoggingGuard)> {
    let lock = RunLock::acquire(state_dir)?;
    let logging = logging::init_logging(log_dir, logging::default_log_file(), verbose)
        .context("Failed to initialize logging")?;
    Ok((lock, logging))
}

fn load_config(path: Option<&Path>) -> Config {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn plan(targets: &Path) -> Result<()> {
    let groups = group_by_subscription(load_targets(targets)?);
    let total: usize = groups.iter().map(|g| g.records.len()).sum();
    println!(
        "{} targets in {} subscription batches",
        total,
        groups.len()
    );
    for group in &groups {
        println!("  {} ({} targets)", group.subscription, group.records.len());
        for record in &group.records {
            println!("    {}/{}", record.resource_group, record.vm_name);
        }
    }
    Ok(())
}

async fn run(
    config: &Config,
    targets: &Path,
    state_dir: &Path,
    write_report: bool,
) -> Result<RunSummary> {
    let records = load_targets(targets)?;
    if records.is_empty() {
        warn!(path = %targets.display(), "Target list has no usable records");
    }

    let credentials = keyring::load_credentials().ok_or_else(|| {
        anyhow!(
            "No service principal credentials found. Run `bootfix --store-credentials` \
             or set {}, {} and {}.",
            keyring::ENV_CLIENT_ID,
            keyring::ENV_CLIENT_SECRET,
            keyring::ENV_TENANT_ID
        )
    })?;

    let control_plane = Arc::new(AzCliControlPlane::new(
        config.az_binary.clone(),
        Duration::from_secs(config.command_timeout_seconds),
    ));
    let orchestrator = Orchestrator::new(
        control_plane,
        credentials,
        pool_settings(config),
        repair_settings(config),
    );
    let summary = orchestrator.run(records).await?;

    if write_report {
        match write_run_report(state_dir, &summary) {
            Ok(path) => info!(path = %path.display(), "Run report written"),
            Err(err) => warn!(error = %format!("{:#}", err), "Failed to write run report"),
        }
    }
    Ok(summary)
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(summary).context("Failed to serialize summary")?;
        println!("{}", out);
        return Ok(());
    }

    for record in summary.records() {
        println!(
            "  {:<40} {:<10} {}",
            record.target.to_string(),
            record.state.to_string(),
            record.outcome
        );
    }
    let counts = summary.counts();
    println!(
        "{} targets: {} completed, {} failed, {} skipped, {} timed out",
        counts.total(),
        counts.completed,
        counts.failed,
        counts.skipped,
        counts.timed_out
    );
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("  {}: ", label);
    io::stdout().flush()?;
    let mut value = String::new();
    io::stdin().read_line(&mut value)?;
    Ok(value.trim().to_string())
}

fn store_credentials_interactive() -> Result<()> {
    println!();
    println!("  Service principal used for `az login`.");
    println!(
        "  Values are stored in your {}.",
        keyring::credentials_store_label()
    );
    println!();
    let credentials = Credentials::new(
        prompt("Client id")?,
        prompt("Client secret")?,
        prompt("Tenant id")?,
    );
    keyring::store_credentials(&credentials).map_err(|e| anyhow!(e))?;
    println!();
    println!("  + Credentials saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flags_override_config() {
        let args = Args::try_parse_from([
            "bootfix",
            "run",
            "targets.csv",
            "--max-jobs",
            "5",
            "--timeout-minutes",
            "30",
            "--script-id",
            "custom",
            "--poll-seconds",
            "2",
        ])
        .unwrap();
        let Some(Command::Run { overrides, .. }) = args.command else {
            panic!("expected run command");
        };

        let mut config = Config::default();
        overrides.apply(&mut config);
        let pool = pool_settings(&config);
        assert_eq!(pool.max_concurrent_jobs, 5);
        assert_eq!(pool.job_timeout, Duration::from_secs(30 * 60));
        assert_eq!(pool.poll_interval, Duration::from_secs(2));
        assert_eq!(repair_settings(&config).script_id, "custom");
    }

    #[test]
    fn test_missing_overrides_keep_config_values() {
        let mut config = Config {
            max_concurrent_jobs: 7,
            ..Config::default()
        };
        Overrides::default().apply(&mut config);
        assert_eq!(config.max_concurrent_jobs, 7);
        assert_eq!(config.repair_script_id, "win-crowdstrike-fix-bootloop");
        assert_eq!(
            repair_settings(&config).swap_grace,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_zero_overrides_are_clamped() {
        let mut config = Config::default();
        Overrides {
            max_jobs: Some(0),
            poll_seconds: Some(0),
            ..Overrides::default()
        }
        .apply(&mut config);
        assert_eq!(config.max_concurrent_jobs, 1);
        assert_eq!(config.poll_interval_seconds, 1);
    }

    #[test]
    fn test_huge_timeout_saturates_instead_of_overflowing() {
        let config = Config {
            job_timeout_minutes: u64::MAX,
            ..Config::default()
        };
        assert_eq!(pool_settings(&config).job_timeout, Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_second_run_leaves_active_log_untouched() {
        let state_dir = tempfile::tempdir().unwrap();
        let log_dir = state_dir.path().join("logs");
        std::fs::create_dir_all(&log_dir).unwrap();
        let log_path = log_dir.join(logging::default_log_file());
        std::fs::write(&log_path, "active run evidence\n").unwrap();

        let _active = RunLock::acquire(state_dir.path()).unwrap();
        let err = start_run(state_dir.path(), &log_dir, false).unwrap_err();

        assert!(err.to_string().contains("already in progress"));
        assert_eq!(
            std::fs::read_to_string(&log_path).unwrap(),
            "active run evidence\n"
        );
    }

    #[test]
    fn test_plan_takes_only_a_path() {
        let args = Args::try_parse_from(["bootfix", "plan", "targets.json", "-v"]).unwrap();
        assert!(args.verbose);
        assert!(matches!(args.command, Some(Command::Plan { .. })));
    }
}
