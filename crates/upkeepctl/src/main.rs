//! Upkeep Control - command-line front end for the Upkeep updater
//!
//! Runs update cycles in-process or hands them to a running daemon, and
//! manages the daemon lifecycle.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use upkeep_common::config::Config;
use upkeep_common::error::UpkeepError;

#[derive(Parser)]
#[command(name = "upkeepctl")]
#[command(about = "Upkeep - keeps an installed package current", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the update daemon in the foreground
    Run {
        /// Do not check for updates at startup
        #[arg(long)]
        skip_update_check: bool,
    },

    /// Show the recorded status and whether the daemon is alive
    Status,

    /// Stop the background daemon
    Stop,

    /// Check for an update and install it
    Update {
        /// Only report whether an update exists
        #[arg(long, conflicts_with = "force")]
        check_only: bool,

        /// Reinstall the latest version even if it is not newer
        #[arg(long)]
        force: bool,
    },

    /// Compare the installed version with the latest published one
    VersionCheck,

    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,

        /// Run start/restart in this process instead of detaching
        #[arg(long, global = true)]
        foreground: bool,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum DaemonAction {
    /// Show daemon status (exit code 7 when not running)
    Status,
    /// Start the daemon in the background
    Start,
    /// Stop the daemon, waiting for an in-progress install to finish
    Stop,
    /// Stop then start the daemon
    Restart,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => "info",
        Commands::Daemon { foreground: true, .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dispatch(cli.command).await {
        output::error(&format!("{:#}", e));
        std::process::exit(exit_code(&e));
    }
}

async fn dispatch(command: Commands) -> Result<()> {
    let config = Config::load()?;

    match command {
        Commands::Run { skip_update_check } => commands::run::run(&config, skip_update_check).await,
        Commands::Status => commands::status::status(&config),
        Commands::Stop => commands::daemon::stop(&config).await,
        Commands::Update { check_only, force } => {
            commands::update::update(&config, check_only, force).await
        }
        Commands::VersionCheck => commands::version_check::version_check(&config).await,
        Commands::Daemon { action, foreground } => match action {
            DaemonAction::Status => commands::daemon::status(&config),
            DaemonAction::Start => commands::daemon::start(&config, foreground).await,
            DaemonAction::Stop => commands::daemon::stop(&config).await,
            DaemonAction::Restart => commands::daemon::restart(&config, foreground).await,
        },
    }
}

/// Exit code for a failure: the `UpkeepError` code when there is one
fn exit_code(e: &anyhow::Error) -> i32 {
    e.chain()
        .find_map(|cause| cause.downcast_ref::<UpkeepError>())
        .map(UpkeepError::exit_code)
        .unwrap_or(1)
}
