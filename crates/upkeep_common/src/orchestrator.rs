//! Update orchestrator - one check/decide/install cycle at a time.
//!
//! Phases per cycle:
//!
//! ```text
//! Idle -> Checking -> UpToDate                                  -> Idle
//!                  -> Downloading -> Verifying -> Installing
//!                                             -> Installed      -> Idle
//!                  -> CheckFailed                               -> Idle
//!                  -> (any install step) InstallFailed          -> Idle
//! ```
//!
//! Per-cycle failures become an `UpdateCycleResult`, never an `Err`. The only
//! errors out of `run_cycle` are about the cycle lock.
//!
//! After `Installed`, an optional post-install command runs (typically an
//! app restart). Its failure is logged and does not change the outcome.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CheckError, InstallError, LockError, UpkeepError};
use crate::installer::PackageInstaller;
use crate::lock::PidLock;
use crate::notify::{NotificationEvent, Notifier};
use crate::remote::{RemoteVersionDescriptor, VersionSource};
use crate::version::{self, Version};

/// Upper bound for the post-install command
const POST_INSTALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    Checking,
    UpToDate,
    Downloading,
    Verifying,
    Installing,
    Installed,
    CheckFailed,
    InstallFailed,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::Checking => "checking",
            UpdatePhase::UpToDate => "up_to_date",
            UpdatePhase::Downloading => "downloading",
            UpdatePhase::Verifying => "verifying",
            UpdatePhase::Installing => "installing",
            UpdatePhase::Installed => "installed",
            UpdatePhase::CheckFailed => "check_failed",
            UpdatePhase::InstallFailed => "install_failed",
        };
        f.write_str(name)
    }
}

/// What a cycle is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    /// Install when the remote version is newer
    Install,
    /// Report only; never downloads
    CheckOnly,
    /// Reinstall the remote version even when it is not newer
    Force,
}

impl fmt::Display for CycleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleMode::Install => write!(f, "install"),
            CycleMode::CheckOnly => write!(f, "check-only"),
            CycleMode::Force => write!(f, "force"),
        }
    }
}

/// Outcome of one cycle
#[derive(Debug, Clone)]
pub enum UpdateCycleResult {
    UpToDate { version: Version },
    /// Newer version exists but installing was not allowed
    UpdateAvailable { from: Version, to: Version },
    Updated { from: Version, to: Version },
    CheckFailed(CheckError),
    InstallFailed { version: Version, error: InstallError },
}

impl UpdateCycleResult {
    /// Stable label for status records
    pub fn label(&self) -> &'static str {
        match self {
            UpdateCycleResult::UpToDate { .. } => "up_to_date",
            UpdateCycleResult::UpdateAvailable { .. } => "update_available",
            UpdateCycleResult::Updated { .. } => "updated",
            UpdateCycleResult::CheckFailed(_) => "check_failed",
            UpdateCycleResult::InstallFailed { .. } => "install_failed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            UpdateCycleResult::CheckFailed(_) | UpdateCycleResult::InstallFailed { .. }
        )
    }

    /// Interrupted by shutdown; says nothing about the remote or the package
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            UpdateCycleResult::CheckFailed(CheckError::Cancelled)
                | UpdateCycleResult::InstallFailed {
                    error: InstallError::Cancelled,
                    ..
                }
        )
    }

    /// The failure as a top-level error, for exit codes
    pub fn into_error(self) -> Option<UpkeepError> {
        match self {
            UpdateCycleResult::CheckFailed(e) => Some(UpkeepError::CheckFailed(e)),
            UpdateCycleResult::InstallFailed { error, .. } => Some(UpkeepError::InstallFailed(error)),
            _ => None,
        }
    }
}

impl fmt::Display for UpdateCycleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateCycleResult::UpToDate { version } => write!(f, "Up to date ({})", version),
            UpdateCycleResult::UpdateAvailable { from, to } => {
                write!(f, "Update available: {} -> {}", from, to)
            }
            UpdateCycleResult::Updated { from, to } => write!(f, "Updated {} -> {}", from, to),
            UpdateCycleResult::CheckFailed(e) => write!(f, "Check failed: {}", e),
            UpdateCycleResult::InstallFailed { version, error } => {
                write!(f, "Install of {} failed: {}", version, error)
            }
        }
    }
}

/// Result plus the phases the cycle went through
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub mode: CycleMode,
    pub result: UpdateCycleResult,
    pub trail: Vec<UpdatePhase>,
}

impl CycleReport {
    pub fn visited(&self, phase: UpdatePhase) -> bool {
        self.trail.contains(&phase)
    }
}

pub struct UpdateOrchestrator {
    source: Box<dyn VersionSource>,
    installer: Box<dyn PackageInstaller>,
    notifier: Box<dyn Notifier>,
    installed: Version,
    notify_only: bool,
    cycle_lock: Option<PathBuf>,
    post_install: Vec<String>,
    phase: UpdatePhase,
    trail: Vec<UpdatePhase>,
}

impl UpdateOrchestrator {
    pub fn new(
        source: Box<dyn VersionSource>,
        installer: Box<dyn PackageInstaller>,
        notifier: Box<dyn Notifier>,
        installed: Version,
    ) -> Self {
        Self {
            source,
            installer,
            notifier,
            installed,
            notify_only: false,
            cycle_lock: None,
            post_install: Vec::new(),
            phase: UpdatePhase::Idle,
            trail: Vec::new(),
        }
    }

    /// Never install; report newer versions instead
    pub fn notify_only(mut self, enabled: bool) -> Self {
        self.notify_only = enabled;
        self
    }

    /// Hold this lock file for the duration of each cycle
    pub fn with_cycle_lock(mut self, path: impl Into<PathBuf>) -> Self {
        self.cycle_lock = Some(path.into());
        self
    }

    /// Command (program plus arguments) to run after each successful install
    pub fn with_post_install(mut self, command: Vec<String>) -> Self {
        self.post_install = command;
        self
    }

    /// Version currently considered installed
    pub fn installed(&self) -> &Version {
        &self.installed
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    /// Run one cycle
    ///
    /// Fails only with `Busy` when another process holds the cycle lock.
    pub async fn run_cycle(
        &mut self,
        mode: CycleMode,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, UpkeepError> {
        let _lock = match &self.cycle_lock {
            Some(path) => Some(PidLock::acquire(path).map_err(|e| match e {
                LockError::Held { holder, .. } => UpkeepError::Busy { pid: holder.pid },
                other => UpkeepError::Lock(other),
            })?),
            None => None,
        };

        self.trail.clear();
        self.enter(UpdatePhase::Idle);
        info!(%mode, installed = %self.installed, "Update cycle started");

        let result = self.cycle(mode, cancel).await;
        self.report(&result);
        self.announce(&result).await;
        if let UpdateCycleResult::Updated { from, to } = &result {
            self.after_install(from, to).await;
        }
        self.enter(UpdatePhase::Idle);

        Ok(CycleReport {
            mode,
            result,
            trail: std::mem::take(&mut self.trail),
        })
    }

    fn enter(&mut self, phase: UpdatePhase) {
        debug!(from = %self.phase, to = %phase, "Phase transition");
        self.phase = phase;
        self.trail.push(phase);
    }

    async fn cycle(&mut self, mode: CycleMode, cancel: &CancellationToken) -> UpdateCycleResult {
        self.enter(UpdatePhase::Checking);
        let descriptor = match self.source.fetch(cancel).await {
            Ok(d) => d,
            Err(e) => {
                self.enter(UpdatePhase::CheckFailed);
                return UpdateCycleResult::CheckFailed(e);
            }
        };

        let from = self.installed.clone();
        let newer = version::is_update_available(&from, &descriptor.version);
        debug!(installed = %from, remote = %descriptor.version, newer, "Compared versions");

        if mode == CycleMode::CheckOnly || (self.notify_only && newer) {
            // Decision only: never enters Downloading
            if newer {
                return UpdateCycleResult::UpdateAvailable {
                    from,
                    to: descriptor.version,
                };
            }
            self.enter(UpdatePhase::UpToDate);
            return UpdateCycleResult::UpToDate { version: from };
        }

        if !newer && (mode != CycleMode::Force || self.notify_only) {
            self.enter(UpdatePhase::UpToDate);
            return UpdateCycleResult::UpToDate { version: from };
        }

        match self.install(&descriptor, cancel).await {
            Ok(()) => {
                self.enter(UpdatePhase::Installed);
                self.installed = descriptor.version.clone();
                UpdateCycleResult::Updated {
                    from,
                    to: descriptor.version,
                }
            }
            Err(error) => {
                self.enter(UpdatePhase::InstallFailed);
                UpdateCycleResult::InstallFailed {
                    version: descriptor.version,
                    error,
                }
            }
        }
    }

    async fn install(
        &mut self,
        descriptor: &RemoteVersionDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(), InstallError> {
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        self.enter(UpdatePhase::Downloading);
        let artifact = self.installer.fetch_artifact(descriptor, cancel).await?;

        self.enter(UpdatePhase::Verifying);
        if let Err(e) = self.installer.verify_artifact(&artifact, descriptor, cancel).await {
            if let Some(path) = artifact.keep() {
                warn!(path = %path.display(), "Artifact kept for diagnosis");
            }
            return Err(e);
        }

        // Last point where shutdown can still abort cleanly
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        self.enter(UpdatePhase::Installing);
        let outcome = self.installer.run_installer(artifact).await?;
        info!(
            version = %outcome.version,
            program = %outcome.program,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Package installed"
        );
        Ok(())
    }

    /// Run the post-install command, best effort
    async fn after_install(&self, from: &Version, to: &Version) {
        let Some((program, args)) = self.post_install.split_first() else {
            return;
        };
        info!(program = %program, "Running post-install command");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("UPKEEP_PREVIOUS_VERSION", from.to_string())
            .env("UPKEEP_VERSION", to.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        match tokio::time::timeout(POST_INSTALL_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                debug!(program = %program, "Post-install command done")
            }
            Ok(Ok(output)) => warn!(
                program = %program,
                code = ?output.status.code(),
                "Post-install command failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Ok(Err(e)) => warn!(program = %program, "Post-install command could not start: {}", e),
            Err(_) => warn!(
                program = %program,
                "Post-install command killed after {}s",
                POST_INSTALL_TIMEOUT.as_secs()
            ),
        }
    }

    fn report(&self, result: &UpdateCycleResult) {
        if result.is_cancelled() {
            info!("Update cycle interrupted by shutdown");
            return;
        }
        match result {
            UpdateCycleResult::UpToDate { version } => info!(%version, "Already up to date"),
            UpdateCycleResult::UpdateAvailable { from, to } => {
                info!(%from, %to, "Update available, not installing")
            }
            UpdateCycleResult::Updated { from, to } => info!(%from, %to, "Update installed"),
            UpdateCycleResult::CheckFailed(e) => {
                warn!(kind = e.kind(), "Update check failed, retrying next cycle: {}", e)
            }
            UpdateCycleResult::InstallFailed { version, error } => error!(
                %version,
                kind = error.kind(),
                "Update failed, retrying next cycle: {}",
                error
            ),
        }
    }

    async fn announce(&self, result: &UpdateCycleResult) {
        let event = match result {
            UpdateCycleResult::UpdateAvailable { from, to } => NotificationEvent::UpdateAvailable {
                from: from.clone(),
                to: to.clone(),
            },
            UpdateCycleResult::Updated { from, to } => NotificationEvent::UpdateInstalled {
                from: from.clone(),
                to: to.clone(),
            },
            UpdateCycleResult::InstallFailed { error: InstallError::Cancelled, .. } => return,
            UpdateCycleResult::InstallFailed { version, error } => NotificationEvent::UpdateFailed {
                version: version.clone(),
                reason: error.to_string(),
            },
            UpdateCycleResult::UpToDate { .. } | UpdateCycleResult::CheckFailed(_) => return,
        };
        self.notifier.notify(&event).await;
    }
}
