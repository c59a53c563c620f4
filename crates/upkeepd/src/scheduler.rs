//! Daemon loop - runs update cycles on an interval until cancelled.
//!
//! Cycles run inline in the loop, so a long cycle delays the next tick
//! instead of overlapping it. On-demand requests share one queue slot.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use upkeep_common::error::{LockError, UpkeepError};
use upkeep_common::lock::PidLock;
use upkeep_common::orchestrator::{CycleMode, CycleReport, UpdateOrchestrator};
use upkeep_common::paths::StatePaths;
use upkeep_common::status::{AppState, ApplicationStatus, StatusStore};

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub interval: Duration,
    /// Install on scheduled cycles; otherwise check and notify
    pub auto_update: bool,
    /// Skip the cycle normally run right after startup
    pub skip_initial_check: bool,
}

impl DaemonOptions {
    fn scheduled_mode(&self) -> CycleMode {
        if self.auto_update {
            CycleMode::Install
        } else {
            CycleMode::CheckOnly
        }
    }
}

/// Result of asking the daemon for a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Will run now, or right after the cycle in progress
    Queued,
    /// A request is already waiting
    Busy,
    /// Daemon is shutting down
    Closed,
}

/// Cheap handle for signal handlers and tests
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    requests: mpsc::Sender<CycleMode>,
    cancel: CancellationToken,
}

impl DaemonHandle {
    pub fn request_cycle(&self, mode: CycleMode) -> RequestOutcome {
        if self.cancel.is_cancelled() {
            return RequestOutcome::Closed;
        }
        match self.requests.try_send(mode) {
            Ok(()) => RequestOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => RequestOutcome::Busy,
            Err(mpsc::error::TrySendError::Closed(_)) => RequestOutcome::Closed,
        }
    }

    /// Ask the loop to stop after the current safe point
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Single-instance update daemon
pub struct Daemon {
    orchestrator: UpdateOrchestrator,
    store: StatusStore,
    lock: PidLock,
    status: ApplicationStatus,
    options: DaemonOptions,
    cancel: CancellationToken,
    requests_tx: mpsc::Sender<CycleMode>,
    requests_rx: mpsc::Receiver<CycleMode>,
}

impl Daemon {
    /// Take the instance lock and record that we are starting
    ///
    /// Fails with `AlreadyRunning` if a live instance holds the lock. A lock
    /// left by a dead process is reclaimed.
    pub fn start(
        paths: &StatePaths,
        orchestrator: UpdateOrchestrator,
        options: DaemonOptions,
    ) -> Result<Self, UpkeepError> {
        paths.ensure_dir()?;
        let lock = PidLock::acquire(&paths.pid_file).map_err(|e| match e {
            LockError::Held { holder, .. } => UpkeepError::AlreadyRunning { pid: holder.pid },
            other => UpkeepError::Lock(other),
        })?;

        let store = StatusStore::new(&paths.status_file);
        let status = ApplicationStatus::new(AppState::Starting, orchestrator.installed().clone());
        store.write(&status)?;

        info!(
            pid = lock.info().pid,
            version = %status.installed_version,
            interval_secs = options.interval.as_secs(),
            "Daemon starting"
        );

        let (requests_tx, requests_rx) = mpsc::channel(1);
        Ok(Self {
            orchestrator,
            store,
            lock,
            status,
            options,
            cancel: CancellationToken::new(),
            requests_tx,
            requests_rx,
        })
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            requests: self.requests_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Run until cancelled, then record `stopped` and release the lock
    pub async fn run(mut self) -> Result<ApplicationStatus, UpkeepError> {
        self.status = self.status.transition(AppState::Running);
        self.store.write(&self.status)?;
        info!("Daemon running");

        if !self.options.skip_initial_check {
            self.run_cycle(self.options.scheduled_mode()).await;
        }

        let period = self.options.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(mode) = self.requests_rx.recv() => {
                    info!(%mode, "On-demand update requested");
                    self.run_cycle(mode).await;
                }
                _ = ticker.tick() => {
                    self.run_cycle(self.options.scheduled_mode()).await;
                }
            }
        }

        self.shutdown()
    }

    async fn run_cycle(&mut self, mode: CycleMode) {
        match self.orchestrator.run_cycle(mode, &self.cancel).await {
            // An interrupted cycle says nothing about the source; keep the last outcome
            Ok(report) if report.result.is_cancelled() => {}
            Ok(report) => self.record(&report),
            Err(UpkeepError::Busy { pid }) => {
                warn!(pid, "Skipping cycle, another update is in progress");
            }
            Err(e) => error!("Update cycle could not start: {}", e),
        }
    }

    fn record(&mut self, report: &CycleReport) {
        self.status = self.status.with_cycle(&report.result);
        if let Err(e) = self.store.write(&self.status) {
            error!("Failed to record cycle outcome: {}", e);
        }
    }

    fn shutdown(self) -> Result<ApplicationStatus, UpkeepError> {
        info!("Daemon stopping");
        let stopped = self.status.transition(AppState::Stopped);
        let written = self.store.write(&stopped);
        self.lock.release()?;
        written?;
        info!("Daemon stopped");
        Ok(stopped)
    }
}
