//! Per-host run state: the single-run lock and finished run reports.

use crate::config::write_atomic;
use anyhow::{anyhow, Context, Result};
use bootfix_core::RunSummary;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "run.lock";
const REPORTS_DIR: &str = "reports";

/// `~/.local/share/bootfix` or the platform equivalent.
pub fn default_state_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|p| p.join("bootfix"))
}

/// Exclusive lock held for the lifetime of a `bootfix run`.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without waiting. Fails if another run holds it.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir).with_context(|| {
            format!("Failed to create state directory '{}'", state_dir.display())
        })?;
        let path = state_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock file '{}'", path.display()))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Self { file, path }),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(anyhow!(
                "Another bootfix run is already in progress (lock held on '{}')",
                path.display()
            )),
            Err(err) => Err(err)
                .with_context(|| format!("Failed to lock '{}'", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Write `summary` to `<state_dir>/reports/<run-id>.json` and return the path.
pub fn write_run_report(state_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = state_dir.join(REPORTS_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create report directory '{}'", dir.display()))?;
    let path = dir.join(format!("{}.json", summary.run_id));
    let content = serde_json::to_string_pretty(summary).context("Failed to serialize run report")?;
    write_atomic(&path, &content)
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("Failed to write run report '{}'", path.display()))?;
    Ok(path)
}
