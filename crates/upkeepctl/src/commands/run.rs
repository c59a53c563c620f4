//! Foreground daemon

use anyhow::Result;

use upkeep_common::config::Config;

pub async fn run(config: &Config, skip_update_check: bool) -> Result<()> {
    let stopped = upkeepd::run_foreground(config, skip_update_check).await?;
    println!("Stopped at {} (version {})", stopped.updated_at.to_rfc3339(), stopped.installed_version);
    Ok(())
}
