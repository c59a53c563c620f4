//! Version check - compares installed and published versions, installs nothing

use anyhow::Result;
use chrono::Local;
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use upkeep_common::config::Config;
use upkeep_common::error::UpkeepError;
use upkeep_common::remote::{HttpVersionSource, VersionSource};
use upkeep_common::status::StatusStore;
use upkeep_common::version::is_update_available;

use crate::output::{header, kv};

pub async fn version_check(config: &Config) -> Result<()> {
    let paths = config.state_paths();
    let installed = upkeep_common::detect_installed(config).await;

    header(&format!("{} version check", config.app.name));
    kv("Installed", &installed.to_string());

    // Last recorded outcome, as the daemon or a previous update wrote it.
    // Shown before the fetch so an unreachable source still reports it.
    let last = StatusStore::new(&paths.status_file)
        .read()?
        .and_then(|record| record.last_cycle);
    match last {
        Some(cycle) => kv(
            "Last cycle",
            &format!(
                "{} ({})",
                cycle.message,
                cycle.at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
            ),
        ),
        None => kv("Last cycle", "none recorded"),
    }

    let source = HttpVersionSource::from_config(config, &installed)?;
    kv("Source", source.url());

    let latest = source
        .fetch(&CancellationToken::new())
        .await
        .map_err(UpkeepError::CheckFailed)?;
    kv("Latest", &latest.version.to_string());

    let verdict = if is_update_available(&installed, &latest.version) {
        format!("{}", "update available".yellow())
    } else {
        format!("{}", "up to date".bright_green())
    };
    kv("Status", &verdict);
    Ok(())
}
