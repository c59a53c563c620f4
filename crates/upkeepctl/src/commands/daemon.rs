//! Daemon lifecycle commands

use anyhow::{Context, Result};

use upkeep_common::config::Config;
use upkeep_common::error::UpkeepError;
use upkeepd::control::{self, StartOptions};

use crate::commands::status::print_status;
use crate::output::ok;

pub fn status(config: &Config) -> Result<()> {
    let current = control::status(&config.state_paths())?;
    print_status(&config.app.name, &current);
    if !current.is_running() {
        return Err(UpkeepError::NotRunning.into());
    }
    Ok(())
}

pub async fn start(config: &Config, foreground: bool) -> Result<()> {
    if foreground {
        return crate::commands::run::run(config, false).await;
    }
    let opts = StartOptions::sibling(config.start_timeout());
    let pid = control::start(&config.state_paths(), &opts)
        .await
        .context("Failed to start daemon")?;
    ok(&format!("Daemon started (PID {})", pid));
    Ok(())
}

pub async fn stop(config: &Config) -> Result<()> {
    let pid = control::stop(&config.state_paths(), config.stop_timeout()).await?;
    ok(&format!("Daemon stopped (PID {})", pid));
    Ok(())
}

pub async fn restart(config: &Config, foreground: bool) -> Result<()> {
    let paths = config.state_paths();
    if foreground {
        match control::stop(&paths, config.stop_timeout()).await {
            Ok(pid) => ok(&format!("Daemon stopped (PID {})", pid)),
            Err(UpkeepError::NotRunning) => {}
            Err(e) => return Err(e.into()),
        }
        return crate::commands::run::run(config, false).await;
    }

    let opts = StartOptions::sibling(config.start_timeout());
    let pid = control::restart(&paths, config.stop_timeout(), &opts)
        .await
        .context("Failed to restart daemon")?;
    ok(&format!("Daemon restarted (PID {})", pid));
    Ok(())
}
