//! Upkeep Common - update engine shared by upkeepd and upkeepctl
//!
//! Version ordering, remote checks, package installs, the per-cycle state
//! machine, and the on-disk lock and status records.

pub mod config;
pub mod error;
pub mod installer;
pub mod lock;
pub mod notify;
pub mod orchestrator;
pub mod paths;
pub mod process;
pub mod remote;
pub mod status;
pub mod version;

pub use config::Config;
pub use error::{CheckError, InstallError, LockError, UpkeepError, VersionError};
pub use installer::{Artifact, InstallOutcome, PackageInstaller};
pub use lock::{LockInfo, LockState, PidLock};
pub use notify::{NotificationEvent, Notifier};
pub use orchestrator::{CycleMode, CycleReport, UpdateCycleResult, UpdateOrchestrator, UpdatePhase};
pub use paths::StatePaths;
pub use remote::{RemoteVersionDescriptor, VersionSource};
pub use status::{AppState, ApplicationStatus, StatusStore};
pub use version::Version;

/// Installed version of the managed package
///
/// dpkg is authoritative when it knows the package; otherwise this build's
/// own version is used.
pub async fn detect_installed(config: &Config) -> Version {
    match installer::query_installed(&config.app.name).await {
        Some(version) => version,
        None => Version::current(),
    }
}

/// Orchestrator wired from config: HTTP source, configured installer,
/// notifier, post-install command, and the cycle lock under `paths`
pub fn orchestrator_from_config(
    config: &Config,
    paths: &StatePaths,
    installed: Version,
) -> error::Result<UpdateOrchestrator> {
    let source = remote::HttpVersionSource::from_config(config, &installed)?;
    let installer = installer::from_config(config, &installed)?;
    let notifier = notify::from_config(&config.app.name, config.daemon.desktop_notifications);
    Ok(
        UpdateOrchestrator::new(Box::new(source), installer, notifier, installed)
            .notify_only(config.update.notify_only)
            .with_post_install(config.installer.post_install.clone())
            .with_cycle_lock(&paths.update_lock),
    )
}
