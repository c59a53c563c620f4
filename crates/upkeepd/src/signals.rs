//! Unix signal wiring
//!
//! - SIGTERM, SIGINT: graceful shutdown
//! - SIGUSR1: on-demand update cycle
//! - SIGUSR2: on-demand forced reinstall

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use upkeep_common::orchestrator::CycleMode;

use crate::scheduler::{DaemonHandle, RequestOutcome};

/// Listen for lifecycle signals until the daemon is cancelled
pub fn install(handle: DaemonHandle) -> std::io::Result<JoinHandle<()>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;

    Ok(tokio::spawn(async move {
        let cancel = handle.cancel_token().clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = term.recv() => {
                    info!("SIGTERM received, shutting down");
                    handle.shutdown();
                }
                _ = int.recv() => {
                    info!("SIGINT received, shutting down");
                    handle.shutdown();
                }
                _ = usr1.recv() => forward(&handle, CycleMode::Install),
                _ = usr2.recv() => forward(&handle, CycleMode::Force),
            }
        }
    }))
}

fn forward(handle: &DaemonHandle, mode: CycleMode) {
    match handle.request_cycle(mode) {
        RequestOutcome::Queued => info!(%mode, "Update requested by signal"),
        RequestOutcome::Busy => warn!(%mode, "Update request rejected, one is already queued"),
        RequestOutcome::Closed => warn!(%mode, "Update request ignored, shutting down"),
    }
}
