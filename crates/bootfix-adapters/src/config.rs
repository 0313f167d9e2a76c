//! Configuration management for bootfix
//!
//! Stores settings in ~/.config/bootfix/config.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_SCRIPT_ID: &str = "win-crowdstrike-fix-bootloop";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_concurrent_jobs: usize,
    pub job_timeout_minutes: u64,
    pub poll_interval_seconds: u64,
    pub repair_script_id: String,
    pub repair_admin_user: String,
    /// Pause after restarting a VM on its original disk.
    pub swap_grace_seconds: u64,
    /// Upper bound for a single `az` invocation.
    pub command_timeout_seconds: u64,
    pub progress_every_ticks: u64,
    pub az_binary: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 20,
            job_timeout_minutes: 70,
            poll_interval_seconds: 1,
            repair_script_id: DEFAULT_SCRIPT_ID.to_string(),
            repair_admin_user: "repairadmin".to_string(),
            swap_grace_seconds: 60,
            command_timeout_seconds: 3600,
            progress_every_ticks: 30,
            az_binary: "az".to_string(),
        }
    }
}

impl Config {
    fn sanitize(&mut self) {
        self.max_concurrent_jobs = self.max_concurrent_jobs.max(1);
        self.job_timeout_minutes = self.job_timeout_minutes.max(1);
        self.poll_interval_seconds = self.poll_interval_seconds.max(1);
        self.command_timeout_seconds = self.command_timeout_seconds.max(1);
        self.progress_every_ticks = self.progress_every_ticks.max(1);
        let defaults = Self::default();
        if self.repair_script_id.trim().is_empty() {
            self.repair_script_id = defaults.repair_script_id;
        }
        if self.repair_admin_user.trim().is_empty() {
            self.repair_admin_user = defaults.repair_admin_user;
        }
        if self.az_binary.trim().is_empty() {
            self.az_binary = defaults.az_binary;
        }
    }

    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("bootfix"))
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from the default location, or return defaults
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load config from `path`. A missing file yields defaults; an unreadable
    /// one is moved aside to `config.json.corrupt` first.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str::<Config>(&content) {
            Ok(mut config) => {
                config.sanitize();
                config
            }
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    error = %err,
                    "Config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), String> {
        let path =
            Self::config_path().ok_or_else(|| "Could not determine config directory".to_string())?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        let mut sanitized = self.clone();
        sanitized.sanitize();

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                    warn!(error = %e, "Failed to set config directory permissions");
                }
            }
        }

        let content = serde_json::to_string_pretty(&sanitized)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        write_atomic(path, &content).map_err(|e| format!("Failed to write config: {}", e))
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/bootfix/config.json".to_string())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

/// Write `content` next to `path` and rename it into place, owner-only on unix.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<(), String> {
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path).map_err(|e| e.to_string())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            warn!(error = %e, "Failed to set temp file permissions");
        }
    }

    file.write_all(content.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| e.to_string())?;
    drop(file);

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.to_string());
    }
    Ok(())
}
