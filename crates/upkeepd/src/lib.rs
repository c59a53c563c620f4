//! Upkeep Daemon - scheduled update cycles and lifecycle control
//!
//! Used by the `upkeepd` binary and by `upkeepctl run` for foreground mode.

pub mod control;
pub mod scheduler;
pub mod signals;

use tracing::info;
use upkeep_common::config::Config;
use upkeep_common::error::UpkeepError;
use upkeep_common::status::ApplicationStatus;

pub use scheduler::{Daemon, DaemonHandle, DaemonOptions, RequestOutcome};

/// Run the daemon in this process until SIGTERM/SIGINT
pub async fn run_foreground(
    config: &Config,
    skip_update_check: bool,
) -> Result<ApplicationStatus, UpkeepError> {
    let paths = config.state_paths();
    let installed = upkeep_common::detect_installed(config).await;
    let orchestrator = upkeep_common::orchestrator_from_config(config, &paths, installed)?;

    let options = DaemonOptions {
        interval: config.check_interval(),
        auto_update: config.update.auto_update,
        skip_initial_check: skip_update_check,
    };

    let daemon = Daemon::start(&paths, orchestrator, options)?;
    let listener = signals::install(daemon.handle())?;
    info!(state_dir = %paths.dir.display(), "State directory");

    let result = daemon.run().await;
    listener.abort();
    result
}
