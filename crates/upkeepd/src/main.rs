//! Upkeep Daemon - keeps the managed package current
//!
//! Checks for updates on an interval and installs them. Stop with SIGTERM;
//! SIGUSR1 requests an immediate update, SIGUSR2 a forced reinstall.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use upkeep_common::config::Config;

#[derive(Parser)]
#[command(name = "upkeepd")]
#[command(about = "Upkeep update daemon", long_about = None)]
#[command(version)]
struct Args {
    /// Do not run a cycle at startup; wait for the first interval
    #[arg(long)]
    skip_update_check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Upkeep Daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    if let Err(e) = upkeepd::run_foreground(&config, args.skip_update_check).await {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
    Ok(())
}
