//! Process liveness and host identity helpers

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{Pid, Uid, User};

/// True when the effective user is root
pub fn is_root() -> bool {
    Uid::effective().is_root()
}

/// True when a process with this PID exists
///
/// Signal 0 checks existence without delivering anything; EPERM means the process
/// exists but belongs to another user.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Best-effort check that `pid` is still running `program`
///
/// Guards against PID reuse after a crash. When the command line cannot be
/// read (non-Linux, hidepid) the process is assumed to match.
pub fn runs_program(pid: u32, program: &str) -> bool {
    if program.is_empty() {
        return true;
    }
    match std::fs::read(format!("/proc/{}/cmdline", pid)) {
        Ok(raw) => {
            let cmdline = String::from_utf8_lossy(&raw);
            cmdline.contains(program)
        }
        Err(_) => true,
    }
}

/// Send a signal to `pid`
pub fn send_signal(pid: u32, signal: Signal) -> Result<(), Errno> {
    let raw = i32::try_from(pid).map_err(|_| Errno::ESRCH)?;
    kill(Pid::from_raw(raw), signal)
}

/// File name of the running executable
pub fn program_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default()
}

/// Host name, or "unknown"
pub fn host_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Name of the effective user, falling back to $USER
pub fn user_name() -> String {
    User::from_uid(Uid::effective())
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_reaped_child_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_alive(pid));
    }

    #[test]
    fn test_pid_zero_not_alive() {
        assert!(!is_alive(0));
    }

    #[test]
    fn test_runs_program_matches_self() {
        let me = program_name();
        assert!(runs_program(std::process::id(), &me));
        assert!(!runs_program(std::process::id(), "definitely-not-this-binary"));
    }

    #[test]
    fn test_identity_not_empty() {
        assert!(!host_name().is_empty());
        assert!(!user_name().is_empty());
    }
}
