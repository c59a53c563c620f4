//! Update command
//!
//! With a live daemon, install and force requests go to the daemon so it
//! stays the only status writer. Without one, the cycle runs here while
//! holding the instance lock.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use upkeep_common::config::Config;
use upkeep_common::error::{LockError, UpkeepError};
use upkeep_common::lock::PidLock;
use upkeep_common::orchestrator::{CycleMode, CycleReport};
use upkeep_common::paths::StatePaths;
use upkeep_common::status::{AppState, ApplicationStatus, StatusStore};
use upkeep_common::version::Version;
use upkeepd::control;

use crate::output::{self, header, kv, note};

pub async fn update(config: &Config, check_only: bool, force: bool) -> Result<()> {
    let mode = match (check_only, force) {
        (true, _) => CycleMode::CheckOnly,
        (false, true) => CycleMode::Force,
        (false, false) => CycleMode::Install,
    };

    let paths = config.state_paths();
    let current = control::status(&paths)?;

    header(&format!("{} update", config.app.name));

    if let Some(pid) = current.daemon_pid() {
        if mode != CycleMode::CheckOnly {
            control::request_cycle(&paths, mode)?;
            note(&format!(
                "Update requested from the running daemon (PID {}); see `upkeepctl status` for the outcome",
                pid
            ));
            return Ok(());
        }
        // Read-only check; the daemon owns the status record
        let installed = current
            .record
            .map(|r| r.installed_version)
            .unwrap_or_else(Version::current);
        let report = run_cycle(config, &paths, installed, mode).await?;
        return finish(report);
    }

    // A live holder without a daemon record is another one-shot update
    let _instance = PidLock::acquire(&paths.pid_file).map_err(|e| match e {
        LockError::Held { holder, .. } => UpkeepError::Busy { pid: holder.pid },
        other => UpkeepError::Lock(other),
    })?;

    let installed = upkeep_common::detect_installed(config).await;
    let report = run_cycle(config, &paths, installed.clone(), mode).await?;

    // Ctrl-C before the install is not an outcome worth keeping
    if !report.result.is_cancelled() {
        let store = StatusStore::new(&paths.status_file);
        let record =
            ApplicationStatus::new(AppState::Stopped, installed).with_cycle(&report.result);
        store.write(&record).context("Failed to record update outcome")?;
    }

    finish(report)
}

async fn run_cycle(
    config: &Config,
    paths: &StatePaths,
    installed: Version,
    mode: CycleMode,
) -> Result<CycleReport> {
    kv("Installed version", &installed.to_string());
    kv("Mode", &mode.to_string());

    let mut orchestrator = upkeep_common::orchestrator_from_config(config, paths, installed)?;

    // Ctrl-C aborts the check or download; an install in progress finishes
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let report = orchestrator.run_cycle(mode, &cancel).await;
    watcher.abort();
    Ok(report?)
}

fn finish(report: CycleReport) -> Result<()> {
    output::cycle_result(&report.result);
    match report.result.into_error() {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
