//! Application status record
//!
//! Single writer (the process holding the instance lock), many readers.
//! `upkeepctl status` and monitoring scripts read this file only - no live
//! probing. Writes go through temp file + fsync + rename so a reader never
//! sees a torn record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::UpkeepError;
use crate::orchestrator::UpdateCycleResult;
use crate::process;
use crate::version::Version;

/// Lifecycle state of the owning process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Starting,
    Running,
    Stopped,
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppState::Starting => write!(f, "starting"),
            AppState::Running => write!(f, "running"),
            AppState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Outcome of the most recent cycle, as shown to users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// `up_to_date`, `update_available`, `updated`, `check_failed`, `install_failed`
    pub outcome: String,
    /// Verbatim outcome text
    pub message: String,
    pub at: DateTime<Utc>,
}

impl CycleRecord {
    pub fn from_result(result: &UpdateCycleResult) -> Self {
        Self {
            outcome: result.label().to_string(),
            message: result.to_string(),
            at: Utc::now(),
        }
    }
}

/// Durable status record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationStatus {
    pub state: AppState,
    pub running: bool,
    pub pid: u32,
    pub installed_version: Version,
    pub user: String,
    pub host: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_cycle: Option<CycleRecord>,
}

impl ApplicationStatus {
    /// Fresh record for the current process
    pub fn new(state: AppState, installed_version: Version) -> Self {
        Self {
            state,
            running: state != AppState::Stopped,
            pid: std::process::id(),
            installed_version,
            user: process::user_name(),
            host: process::host_name(),
            updated_at: Utc::now(),
            last_cycle: None,
        }
    }

    /// Copy with a new lifecycle state and timestamp
    pub fn transition(&self, state: AppState) -> Self {
        Self {
            state,
            running: state != AppState::Stopped,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Copy with the cycle outcome applied
    ///
    /// Only a successful install moves `installed_version`.
    pub fn with_cycle(&self, result: &UpdateCycleResult) -> Self {
        let installed_version = match result {
            UpdateCycleResult::Updated { to, .. } => to.clone(),
            _ => self.installed_version.clone(),
        };
        Self {
            installed_version,
            updated_at: Utc::now(),
            last_cycle: Some(CycleRecord::from_result(result)),
            ..self.clone()
        }
    }
}

/// File-backed status store
#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the record
    pub fn write(&self, status: &ApplicationStatus) -> Result<(), UpkeepError> {
        let content = serde_json::to_string_pretty(status)?;
        atomic_write(&self.path, content.as_bytes()).map_err(|e| {
            UpkeepError::Status(format!("cannot write {}: {}", self.path.display(), e))
        })?;
        debug!(state = %status.state, path = %self.path.display(), "Status written");
        Ok(())
    }

    /// Read the record; `None` means never started
    pub fn read(&self) -> Result<Option<ApplicationStatus>, UpkeepError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(UpkeepError::Status(format!(
                    "cannot read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        serde_json::from_str(&content).map(Some).map_err(|e| {
            UpkeepError::Status(format!("malformed status {}: {}", self.path.display(), e))
        })
    }
}

/// Write via a temp file in the same directory, fsync, then rename
pub fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}
