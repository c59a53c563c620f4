//! Lifecycle control: start, stop, status, restart, and on-demand requests.
//!
//! Everything here works from the state directory alone (instance lock plus
//! status record), so it behaves the same from any process.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use upkeep_common::error::UpkeepError;
use upkeep_common::lock::{self, LockInfo, LockState};
use upkeep_common::orchestrator::CycleMode;
use upkeep_common::paths::{StatePaths, STATE_DIR_ENV};
use upkeep_common::process;
use upkeep_common::status::{AppState, ApplicationStatus, StatusStore};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Daemon binary name
pub const DAEMON_BINARY: &str = "upkeepd";

/// Whether the instance lock has a live holder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Running(LockInfo),
    /// Lock file left by a process that is gone
    Stale(Option<LockInfo>),
    NotRunning,
}

/// Everything `status` reports
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub liveness: Liveness,
    /// `None` when the daemon never started here
    pub record: Option<ApplicationStatus>,
}

impl DaemonStatus {
    pub fn is_running(&self) -> bool {
        matches!(self.liveness, Liveness::Running(_))
    }

    /// The lock holder is a daemon loop ready for update requests
    ///
    /// A `starting` daemon holds the lock but may still be in its initial
    /// cycle, so it is not reported here.
    pub fn daemon_pid(&self) -> Option<u32> {
        self.holder_in(AppState::Running)
    }

    /// The lock holder is a daemon that has not reached its loop yet
    pub fn starting_pid(&self) -> Option<u32> {
        self.holder_in(AppState::Starting)
    }

    fn holder_in(&self, state: AppState) -> Option<u32> {
        let Liveness::Running(holder) = &self.liveness else {
            return None;
        };
        match &self.record {
            Some(r) if r.pid == holder.pid && r.state == state => Some(holder.pid),
            _ => None,
        }
    }
}

/// How to launch a background daemon
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub program: PathBuf,
    pub skip_update_check: bool,
    pub timeout: Duration,
}

impl StartOptions {
    /// `upkeepd` next to the current executable, else from `PATH`
    pub fn sibling(timeout: Duration) -> Self {
        let program = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DAEMON_BINARY)))
            .filter(|p| p.is_file())
            .unwrap_or_else(|| PathBuf::from(DAEMON_BINARY));
        Self {
            program,
            skip_update_check: false,
            timeout,
        }
    }
}

/// Read lock liveness and the status record
pub fn status(paths: &StatePaths) -> Result<DaemonStatus, UpkeepError> {
    let liveness = match lock::inspect(&paths.pid_file)? {
        LockState::Held(info) => Liveness::Running(info),
        LockState::Stale(info) => Liveness::Stale(info),
        LockState::Free => Liveness::NotRunning,
    };
    let record = StatusStore::new(&paths.status_file).read()?;
    Ok(DaemonStatus { liveness, record })
}

/// Launch the daemon in the background and wait for it to take the lock
pub async fn start(paths: &StatePaths, opts: &StartOptions) -> Result<u32, UpkeepError> {
    match lock::inspect(&paths.pid_file)? {
        LockState::Held(holder) => return Err(UpkeepError::AlreadyRunning { pid: holder.pid }),
        LockState::Stale(_) => {
            lock::clear_stale(&paths.pid_file)?;
        }
        LockState::Free => {}
    }

    paths.ensure_dir()?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)?;

    let mut cmd = Command::new(&opts.program);
    if opts.skip_update_check {
        cmd.arg("--skip-update-check");
    }
    cmd.env(STATE_DIR_ENV, &paths.dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log))
        // Own process group: a Ctrl-C in the launching terminal must not reach it
        .process_group(0);

    let mut child = cmd.spawn().map_err(|e| UpkeepError::Spawn {
        program: opts.program.display().to_string(),
        reason: e.to_string(),
    })?;
    let pid = child.id();
    info!(pid, program = %opts.program.display(), "Daemon launched");

    let deadline = Instant::now() + opts.timeout;
    loop {
        match lock::inspect(&paths.pid_file)? {
            LockState::Held(holder) if holder.pid == pid => return Ok(pid),
            // Another starter won the race
            LockState::Held(holder) => return Err(UpkeepError::AlreadyRunning { pid: holder.pid }),
            _ => {}
        }

        if let Ok(Some(exit)) = child.try_wait() {
            return Err(UpkeepError::Spawn {
                program: opts.program.display().to_string(),
                reason: format!("exited with {}; see {}", exit, paths.log_file.display()),
            });
        }

        if Instant::now() >= deadline {
            return Err(UpkeepError::Spawn {
                program: opts.program.display().to_string(),
                reason: format!(
                    "did not take the instance lock within {}s; see {}",
                    opts.timeout.as_secs(),
                    paths.log_file.display()
                ),
            });
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Ask the daemon to stop and wait for it to exit
///
/// Never escalates to SIGKILL: an install in progress must finish. Returns
/// the PID that stopped.
pub async fn stop(paths: &StatePaths, timeout: Duration) -> Result<u32, UpkeepError> {
    let holder = match lock::inspect(&paths.pid_file)? {
        LockState::Held(holder) => holder,
        LockState::Stale(_) => {
            lock::clear_stale(&paths.pid_file)?;
            mark_stopped(paths);
            return Err(UpkeepError::NotRunning);
        }
        LockState::Free => return Err(UpkeepError::NotRunning),
    };

    let pid = holder.pid;
    match process::send_signal(pid, Signal::SIGTERM) {
        Ok(()) => info!(pid, "Sent SIGTERM"),
        Err(Errno::ESRCH) => debug!(pid, "Process already gone"),
        Err(e) => return Err(UpkeepError::Signal(format!("SIGTERM to {}: {}", pid, e))),
    }

    let deadline = Instant::now() + timeout;
    loop {
        match lock::inspect(&paths.pid_file)? {
            LockState::Held(current) if current.pid == pid => {}
            LockState::Stale(_) => {
                // Exited without cleaning up
                lock::clear_stale(&paths.pid_file)?;
                mark_stopped(paths);
                return Ok(pid);
            }
            _ => return Ok(pid),
        }

        if Instant::now() >= deadline {
            warn!(pid, "Daemon still running after {}s", timeout.as_secs());
            return Err(UpkeepError::StillStopping {
                pid,
                waited: timeout,
            });
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Stop (if running) then start
pub async fn restart(
    paths: &StatePaths,
    stop_timeout: Duration,
    opts: &StartOptions,
) -> Result<u32, UpkeepError> {
    match stop(paths, stop_timeout).await {
        Ok(pid) => info!(pid, "Stopped for restart"),
        Err(UpkeepError::NotRunning) => debug!("Not running, starting fresh"),
        Err(e) => return Err(e),
    }
    start(paths, opts).await
}

/// Forward an on-demand cycle to the running daemon
///
/// Install cycles use SIGUSR1 and forced reinstalls SIGUSR2. Check-only
/// cycles are not forwarded; they are cheap to run in the caller.
pub fn request_cycle(paths: &StatePaths, mode: CycleMode) -> Result<u32, UpkeepError> {
    let signal = match mode {
        CycleMode::Install => Signal::SIGUSR1,
        CycleMode::Force => Signal::SIGUSR2,
        CycleMode::CheckOnly => {
            return Err(UpkeepError::Signal(
                "check-only cycles run in the requesting process".to_string(),
            ))
        }
    };

    let current = status(paths)?;
    let pid = match (current.daemon_pid(), &current.liveness) {
        (Some(pid), _) => pid,
        // Lock held by a one-shot update, which has no signal handlers
        (None, Liveness::Running(holder)) => return Err(UpkeepError::Busy { pid: holder.pid }),
        (None, _) => return Err(UpkeepError::NotRunning),
    };

    process::send_signal(pid, signal)
        .map_err(|e| UpkeepError::Signal(format!("{} to {}: {}", signal, pid, e)))?;
    info!(pid, %mode, "Update request sent to daemon");
    Ok(pid)
}

/// Best-effort fix-up of a record left `running` by a crashed daemon
fn mark_stopped(paths: &StatePaths) {
    let store = StatusStore::new(&paths.status_file);
    match store.read() {
        Ok(Some(record)) if record.state != AppState::Stopped => {
            if let Err(e) = store.write(&record.transition(AppState::Stopped)) {
                warn!("Could not mark status stopped: {}", e);
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Could not read status: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use upkeep_common::lock::PidLock;
    use upkeep_common::version::Version;

    #[test]
    fn test_status_never_started() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::with_root(temp.path(), "myapp");
        let st = status(&paths).unwrap();
        assert_eq!(st.liveness, Liveness::NotRunning);
        assert!(st.record.is_none());
        assert!(st.daemon_pid().is_none());
    }

    #[test]
    fn test_one_shot_holder_is_not_a_daemon() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::with_root(temp.path(), "myapp");
        let _lock = PidLock::acquire(&paths.pid_file).unwrap();

        // Stopped record: the holder is a one-shot update
        let store = StatusStore::new(&paths.status_file);
        store
            .write(&ApplicationStatus::new(AppState::Stopped, Version::new(1, 0, 0)))
            .unwrap();

        let st = status(&paths).unwrap();
        assert!(st.is_running());
        assert!(st.daemon_pid().is_none());
        assert!(matches!(
            request_cycle(&paths, CycleMode::Install),
            Err(UpkeepError::Busy { .. })
        ));
    }

    #[test]
    fn test_starting_daemon_takes_no_requests() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::with_root(temp.path(), "myapp");
        let _lock = PidLock::acquire(&paths.pid_file).unwrap();

        let store = StatusStore::new(&paths.status_file);
        store
            .write(&ApplicationStatus::new(AppState::Starting, Version::new(1, 0, 0)))
            .unwrap();

        let st = status(&paths).unwrap();
        assert!(st.daemon_pid().is_none());
        assert_eq!(st.starting_pid(), Some(std::process::id()));
        // No signal goes out; this test process would not survive SIGUSR1
        assert!(matches!(
            request_cycle(&paths, CycleMode::Install),
            Err(UpkeepError::Busy { .. })
        ));

        store
            .write(&ApplicationStatus::new(AppState::Running, Version::new(1, 0, 0)))
            .unwrap();
        assert_eq!(status(&paths).unwrap().daemon_pid(), Some(std::process::id()));
    }

    #[test]
    fn test_request_cycle_not_running() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::with_root(temp.path(), "myapp");
        assert!(matches!(
            request_cycle(&paths, CycleMode::Force),
            Err(UpkeepError::NotRunning)
        ));
        assert!(request_cycle(&paths, CycleMode::CheckOnly).is_err());
    }

    #[tokio::test]
    async fn test_stop_not_running() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::with_root(temp.path(), "myapp");
        let err = stop(&paths, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.exit_code(), 7);
    }

    #[tokio::test]
    async fn test_stop_cleans_stale_lock() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::with_root(temp.path(), "myapp");
        std::fs::write(&paths.pid_file, "999999999\n").unwrap();

        let store = StatusStore::new(&paths.status_file);
        store
            .write(&ApplicationStatus::new(AppState::Running, Version::new(1, 0, 0)))
            .unwrap();

        assert!(matches!(
            stop(&paths, Duration::from_secs(1)).await,
            Err(UpkeepError::NotRunning)
        ));
        assert!(!paths.pid_file.exists());
        assert_eq!(store.read().unwrap().unwrap().state, AppState::Stopped);
    }

    #[tokio::test]
    async fn test_start_refuses_when_running() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::with_root(temp.path(), "myapp");
        let _lock = PidLock::acquire(&paths.pid_file).unwrap();

        let opts = StartOptions {
            program: PathBuf::from("/nonexistent/upkeepd"),
            skip_update_check: true,
            timeout: Duration::from_secs(1),
        };
        let err = start(&paths, &opts).await.unwrap_err();
        assert!(matches!(err, UpkeepError::AlreadyRunning { pid } if pid == std::process::id()));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_start_reports_spawn_failure() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::with_root(temp.path(), "myapp");
        let opts = StartOptions {
            program: PathBuf::from("/nonexistent/upkeepd"),
            skip_update_check: false,
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            start(&paths, &opts).await,
            Err(UpkeepError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_reports_early_exit() {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::with_root(temp.path(), "myapp");
        let opts = StartOptions {
            program: PathBuf::from("false"),
            skip_update_check: false,
            timeout: Duration::from_secs(5),
        };
        match start(&paths, &opts).await {
            Err(UpkeepError::Spawn { reason, .. }) => assert!(reason.contains("daemon.log")),
            other => panic!("expected Spawn error, got {:?}", other),
        }
    }
}
