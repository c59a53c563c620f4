//! Error types for Upkeep.
//!
//! Per-cycle failures (`CheckError`, `InstallError`) are absorbed by the
//! orchestrator and recorded; only `UpkeepError` reaches a process exit code.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::lock::LockInfo;
use crate::version::Version;

/// MalformedVersion - bad input, not retryable until the source is fixed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Malformed version: empty string")]
    Empty,

    #[error("Malformed version '{input}': expected MAJOR.MINOR.PATCH, found {found} component(s)")]
    ComponentCount { input: String, found: usize },

    #[error("Malformed version '{input}': negative component '{component}'")]
    Negative { input: String, component: String },

    #[error("Malformed version '{input}': non-numeric component '{component}'")]
    NonNumeric { input: String, component: String },

    #[error("Malformed version '{input}': invalid tag '{tag}'")]
    InvalidTag { input: String, tag: String },
}

/// Failures of the remote version check, retried on the next cycle
#[derive(Error, Debug, Clone)]
pub enum CheckError {
    #[error("Remote unreachable: {0}")]
    Unreachable(String),

    #[error("Remote check timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Check cancelled by shutdown")]
    Cancelled,
}

/// Failures of the download/verify/install pipeline, retried on the next cycle
#[derive(Error, Debug, Clone)]
pub enum InstallError {
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("{program} exited with {}{}", exit_label(.code), artifact_hint(.artifact))]
    InstallerExitedNonZero {
        program: String,
        code: Option<i32>,
        stderr: String,
        /// Downloaded artifact left in place for manual recovery
        artifact: Option<PathBuf>,
    },

    #[error("Elevated privileges required: {0}")]
    PrivilegeRequired(String),

    /// Package manager succeeded but the package is not at the expected version
    #[error("Package manager left {} installed, expected {expected}", installed_label(.found))]
    NotApplied {
        expected: Version,
        found: Option<Version>,
    },

    #[error("Install cancelled by shutdown")]
    Cancelled,
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {}", c),
        None => "no exit code (killed by signal)".to_string(),
    }
}

fn installed_label(found: &Option<Version>) -> String {
    match found {
        Some(v) => v.to_string(),
        None => "no version".to_string(),
    }
}

fn artifact_hint(artifact: &Option<PathBuf>) -> String {
    match artifact {
        Some(path) => format!(" (artifact kept at {})", path.display()),
        None => String::new(),
    }
}

impl InstallError {
    /// Short machine-friendly kind used in logs and status records
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DownloadFailed(_) => "download_failed",
            Self::IntegrityCheckFailed(_) => "integrity_check_failed",
            Self::InstallerExitedNonZero { .. } => "installer_exited_non_zero",
            Self::PrivilegeRequired(_) => "privilege_required",
            Self::NotApplied { .. } => "not_applied",
            Self::Cancelled => "cancelled",
        }
    }
}

impl CheckError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::Timeout(_) => "timeout",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Errors from PID lock operations
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock {} held by PID {} ({})", .path.display(), .holder.pid, .holder.program)]
    Held { path: PathBuf, holder: LockInfo },

    #[error("Lock IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level errors surfaced to the CLI and daemon entry points
#[derive(Error, Debug)]
pub enum UpkeepError {
    #[error("Already running with PID {pid}")]
    AlreadyRunning { pid: u32 },

    #[error("Another update cycle is in progress (PID {pid})")]
    Busy { pid: u32 },

    #[error("Daemon is not running")]
    NotRunning,

    #[error("Daemon (PID {pid}) did not exit within {}s; it may be finishing an install", .waited.as_secs())]
    StillStopping { pid: u32, waited: Duration },

    #[error("Update check failed: {0}")]
    CheckFailed(#[from] CheckError),

    #[error("Update failed: {0}")]
    InstallFailed(#[from] InstallError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Status store error: {0}")]
    Status(String),

    #[error("Lock error: {0}")]
    Lock(#[source] LockError),

    #[error("Failed to launch {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl UpkeepError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            UpkeepError::AlreadyRunning { .. } => 3,
            UpkeepError::InstallFailed(_) => 4,
            UpkeepError::CheckFailed(_) => 5,
            UpkeepError::Busy { .. } => 6,
            UpkeepError::NotRunning => 7,
            UpkeepError::StillStopping { .. } => 8,
            UpkeepError::Config(_)
            | UpkeepError::Status(_)
            | UpkeepError::Lock(_)
            | UpkeepError::Spawn { .. }
            | UpkeepError::Signal(_)
            | UpkeepError::Io(_)
            | UpkeepError::Json(_) => 1,
        }
    }
}

impl From<LockError> for UpkeepError {
    fn from(e: LockError) -> Self {
        UpkeepError::Lock(e)
    }
}

pub type Result<T> = std::result::Result<T, UpkeepError>;
