//! Status command - reads the state directory only, no network

use anyhow::Result;
use chrono::Local;
use owo_colors::OwoColorize;

use upkeep_common::config::Config;
use upkeepd::control::{self, DaemonStatus, Liveness};

use crate::output::{header, kv};

pub fn status(config: &Config) -> Result<()> {
    let paths = config.state_paths();
    let current = control::status(&paths)?;
    print_status(&config.app.name, &current);
    kv("State directory", &paths.dir.display().to_string());
    Ok(())
}

pub fn print_status(app: &str, current: &DaemonStatus) {
    header(&format!("{} status", app));

    let liveness = match &current.liveness {
        Liveness::Running(holder) if current.daemon_pid().is_some() => {
            format!("{} (PID {})", "running".bright_green(), holder.pid)
        }
        Liveness::Running(holder) if current.starting_pid().is_some() => {
            format!("{} (PID {})", "starting".yellow(), holder.pid)
        }
        Liveness::Running(holder) => {
            format!("{} (PID {})", "updating".yellow(), holder.pid)
        }
        Liveness::Stale(Some(holder)) => {
            format!("{} (PID {} is gone)", "not running, stale lock".yellow(), holder.pid)
        }
        Liveness::Stale(None) => format!("{}", "not running, unreadable lock".yellow()),
        Liveness::NotRunning => "not running".to_string(),
    };
    kv("Daemon", &liveness);

    let Some(record) = &current.record else {
        kv("Status", "never started");
        return;
    };

    kv("State", &record.state.to_string());
    kv("Installed version", &record.installed_version.to_string());
    kv("PID", &record.pid.to_string());
    kv("User", &format!("{}@{}", record.user, record.host));
    kv(
        "Updated",
        &record
            .updated_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
    );
    match &record.last_cycle {
        Some(cycle) => kv(
            "Last cycle",
            &format!(
                "{} ({})",
                cycle.message,
                cycle.at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
            ),
        ),
        None => kv("Last cycle", "none yet"),
    }
}
