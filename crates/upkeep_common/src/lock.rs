//! Liveness-checked PID locks
//!
//! One lock file type serves two purposes:
//! - the instance lock (`<name>.pid`): one daemon per host
//! - the cycle lock (`update.lock`): one update attempt at a time
//!
//! A record whose PID is dead, or now runs a different program, is stale and
//! gets reclaimed. Creation uses O_EXCL so two starters cannot both win.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{debug, info, warn};

use crate::error::LockError;
use crate::process as proc_util;

/// Lock file contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID holding the lock
    pub pid: u32,
    /// Executable name of the holder, used to detect PID reuse
    pub program: String,
    /// Hostname for debugging
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn for_current_process() -> Self {
        Self {
            pid: process::id(),
            program: proc_util::program_name(),
            host: proc_util::host_name(),
            acquired_at: Utc::now(),
        }
    }

    /// Holder is alive and still the same program
    pub fn is_live(&self) -> bool {
        proc_util::is_alive(self.pid) && proc_util::runs_program(self.pid, &self.program)
    }
}

/// What a lock file currently says
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// No lock file
    Free,
    /// Held by a live process
    Held(LockInfo),
    /// Lock file present but its holder is gone (or the file is unreadable)
    Stale(Option<LockInfo>),
}

/// Inspect a lock file without modifying it
pub fn inspect(path: &Path) -> Result<LockState, LockError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LockState::Free),
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    match parse_record(&content) {
        Some(info) if info.is_live() => Ok(LockState::Held(info)),
        Some(info) => Ok(LockState::Stale(Some(info))),
        None => Ok(LockState::Stale(None)),
    }
}

/// Accepts the JSON record and a bare PID (written by older tooling)
fn parse_record(content: &str) -> Option<LockInfo> {
    if let Ok(info) = serde_json::from_str::<LockInfo>(content) {
        return Some(info);
    }
    content.trim().parse::<u32>().ok().map(|pid| LockInfo {
        pid,
        program: String::new(),
        host: String::new(),
        acquired_at: DateTime::<Utc>::default(),
    })
}

/// Remove a lock file if its holder is no longer alive
///
/// Returns the stale record when something was removed.
pub fn clear_stale(path: &Path) -> Result<Option<LockInfo>, LockError> {
    match inspect(path)? {
        LockState::Stale(info) => {
            remove(path)?;
            if let Some(holder) = &info {
                info!(pid = holder.pid, path = %path.display(), "Removed stale lock");
            }
            Ok(info)
        }
        _ => Ok(None),
    }
}

fn remove(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Held PID lock - released on drop
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    info: LockInfo,
    released: bool,
}

impl PidLock {
    /// Attempt to acquire the lock at `path`
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let info = LockInfo::for_current_process();
        let content = serde_json::to_string_pretty(&info).map_err(|e| LockError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(ErrorKind::InvalidData, e),
        })?;

        // Second attempt only happens after a stale record was removed
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    file.write_all(content.as_bytes())
                        .and_then(|_| file.sync_all())
                        .map_err(|source| LockError::Io {
                            path: path.to_path_buf(),
                            source,
                        })?;
                    debug!(pid = info.pid, path = %path.display(), "Lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        info,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match inspect(path)? {
                    LockState::Held(holder) => {
                        return Err(LockError::Held {
                            path: path.to_path_buf(),
                            holder,
                        })
                    }
                    LockState::Stale(holder) => {
                        match &holder {
                            Some(h) => warn!(
                                pid = h.pid,
                                path = %path.display(),
                                "Reclaiming lock from dead process"
                            ),
                            None => warn!(path = %path.display(), "Reclaiming unreadable lock file"),
                        }
                        remove(path)?;
                    }
                    LockState::Free => {}
                },
                Err(source) => {
                    return Err(LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }
        }

        // Lost a race with another starter that created the file in between
        match inspect(path)? {
            LockState::Held(holder) | LockState::Stale(Some(holder)) => Err(LockError::Held {
                path: path.to_path_buf(),
                holder,
            }),
            _ => Err(LockError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(ErrorKind::WouldBlock, "lock contention"),
            }),
        }
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if we still hold the lock
    pub fn is_valid(&self) -> bool {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|c| serde_json::from_str::<LockInfo>(&c).ok())
            .map(|info| info.pid == self.info.pid)
            .unwrap_or(false)
    }

    /// Release explicitly, reporting IO errors
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        if self.is_valid() {
            remove(&self.path)?;
            debug!(path = %self.path.display(), "Lock released");
        }
        Ok(())
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if self.released || !self.is_valid() {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "Failed to release lock: {}", e);
        }
    }
}
