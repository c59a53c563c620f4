//! User-facing notifications
//!
//! Best effort: a notification that cannot be delivered is logged and
//! otherwise ignored.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::version::Version;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    UpdateAvailable { from: Version, to: Version },
    UpdateInstalled { from: Version, to: Version },
    UpdateFailed { version: Version, reason: String },
}

impl NotificationEvent {
    pub fn summary(&self) -> &'static str {
        match self {
            NotificationEvent::UpdateAvailable { .. } => "Update Available",
            NotificationEvent::UpdateInstalled { .. } => "Update Complete",
            NotificationEvent::UpdateFailed { .. } => "Update Failed",
        }
    }

    pub fn body(&self, app: &str) -> String {
        match self {
            NotificationEvent::UpdateAvailable { from, to } => {
                format!("{} {} is available (installed: {})", app, to, from)
            }
            NotificationEvent::UpdateInstalled { from, to } => {
                format!("{} has been updated from {} to {}", app, from, to)
            }
            NotificationEvent::UpdateFailed { version, reason } => {
                format!("{} {} could not be installed: {}", app, version, reason)
            }
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotificationEvent);
}

/// Log-only notifier for headless hosts
#[derive(Debug, Clone)]
pub struct LogNotifier {
    app: String,
}

impl LogNotifier {
    pub fn new(app: &str) -> Self {
        Self {
            app: app.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &NotificationEvent) {
        info!("{}: {}", event.summary(), event.body(&self.app));
    }
}

/// Desktop notification via `notify-send`, also logged
#[derive(Debug, Clone)]
pub struct DesktopNotifier {
    app: String,
    log: LogNotifier,
}

impl DesktopNotifier {
    pub fn new(app: &str) -> Self {
        Self {
            app: app.to_string(),
            log: LogNotifier::new(app),
        }
    }
}

#[async_trait]
impl Notifier for DesktopNotifier {
    async fn notify(&self, event: &NotificationEvent) {
        self.log.notify(event).await;

        let result = Command::new("notify-send")
            .arg(format!("--app-name={}", self.app))
            .arg("--icon=system-software-update")
            .arg(event.summary())
            .arg(event.body(&self.app))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match result {
            Ok(status) if status.success() => {}
            Ok(status) => debug!("notify-send exited with {}", status),
            Err(e) => debug!("notify-send unavailable: {}", e),
        }
    }
}

/// Notifier selected by config
pub fn from_config(app: &str, desktop: bool) -> Box<dyn Notifier> {
    if desktop {
        Box::new(DesktopNotifier::new(app))
    } else {
        Box::new(LogNotifier::new(app))
    }
}
