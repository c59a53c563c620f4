//! Persisted state layout
//!
//! System-wide (`/var/run/<name>`) when running as root or when that
//! directory already exists, per-user (`~/.<name>`) otherwise.

use std::path::{Path, PathBuf};

use crate::process;

/// Environment override for the state directory
pub const STATE_DIR_ENV: &str = "UPKEEP_STATE_DIR";

/// Root for system-wide state
pub const SYSTEM_RUN_DIR: &str = "/var/run";

/// Resolved locations of every file the daemon and CLI share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub dir: PathBuf,
    /// Instance lock (PID record)
    pub pid_file: PathBuf,
    /// Per-cycle update lock
    pub update_lock: PathBuf,
    /// Application status record
    pub status_file: PathBuf,
    /// Background daemon output
    pub log_file: PathBuf,
}

impl StatePaths {
    /// Layout rooted at an explicit directory
    pub fn with_root(dir: impl Into<PathBuf>, app_name: &str) -> Self {
        let dir = dir.into();
        Self {
            pid_file: dir.join(format!("{}.pid", app_name)),
            update_lock: dir.join("update.lock"),
            status_file: dir.join("status"),
            log_file: dir.join("daemon.log"),
            dir,
        }
    }

    /// Resolve the layout for this process
    ///
    /// Precedence: `UPKEEP_STATE_DIR`, then `configured`, then the
    /// privilege-dependent default.
    pub fn resolve(app_name: &str, configured: Option<&Path>) -> Self {
        if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|v| !v.is_empty()) {
            return Self::with_root(PathBuf::from(dir), app_name);
        }
        if let Some(dir) = configured {
            return Self::with_root(dir, app_name);
        }
        Self::with_root(default_state_dir(app_name), app_name)
    }

    /// Create the state directory if needed
    pub fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }
}

fn default_state_dir(app_name: &str) -> PathBuf {
    let system_dir = Path::new(SYSTEM_RUN_DIR).join(app_name);
    if process::is_root() || system_dir.is_dir() {
        return system_dir;
    }

    match dirs::home_dir() {
        Some(home) => home.join(format!(".{}", app_name)),
        // No home directory (service accounts): fall back to the temp dir
        None => std::env::temp_dir().join(format!(".{}", app_name)),
    }
}
