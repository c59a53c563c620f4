//! End-to-end runs of the upkeepctl binary against a temp state directory

use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Output;
use tempfile::TempDir;
use tokio::process::Command;

use upkeep_common::lock::PidLock;
use upkeep_common::paths::StatePaths;
use upkeep_common::status::{AppState, ApplicationStatus, StatusStore};
use upkeep_common::version::Version;

const APP: &str = "upkeep-cli-test";

struct Env {
    dir: TempDir,
    config: PathBuf,
}

impl Env {
    fn new(version_url: &str) -> Self {
        Self::with_config(&format!(
            r#"
[app]
name = "{APP}"

[update]
version_url = "{version_url}"
check_timeout_secs = 2

[daemon]
desktop_notifications = false
"#
        ))
    }

    fn with_config(toml: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.toml");
        std::fs::write(&config, toml).unwrap();
        Self { dir, config }
    }

    fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    fn paths(&self) -> StatePaths {
        StatePaths::with_root(self.state_dir(), APP)
    }

    async fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_upkeepctl"))
            .args(args)
            .env("UPKEEP_CONFIG", &self.config)
            .env("UPKEEP_STATE_DIR", self.state_dir())
            .env_remove("RUST_LOG")
            .output()
            .await
            .unwrap()
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn recorded(path: &Path) -> Option<ApplicationStatus> {
    StatusStore::new(path).read().unwrap()
}

/// Port with nothing listening on it
fn closed_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/version", addr)
}

async fn serve_version(body: &'static str) -> SocketAddr {
    let app = Router::new().route("/version", get(move || async move { body }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_status_before_first_start() {
    let env = Env::new(&closed_url());
    let out = env.run(&["status"]).await;
    assert!(out.status.success());
    assert!(stdout(&out).contains("never started"));
}

#[tokio::test]
async fn test_daemon_status_not_running() {
    let env = Env::new(&closed_url());
    let out = env.run(&["daemon", "status"]).await;
    assert_eq!(out.status.code(), Some(7));
}

#[tokio::test]
async fn test_stop_without_daemon() {
    let env = Env::new(&closed_url());
    let out = env.run(&["stop"]).await;
    assert_eq!(out.status.code(), Some(7));
}

#[tokio::test]
async fn test_check_only_and_force_conflict() {
    let env = Env::new(&closed_url());
    let out = env.run(&["update", "--check-only", "--force"]).await;
    assert_eq!(out.status.code(), Some(2));
}

#[tokio::test]
async fn test_invalid_config_is_generic_failure() {
    let env = Env::with_config("[update]\ncheck_interval_hours = 0\n");
    let out = env.run(&["status"]).await;
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("check_interval_hours"));
}

#[tokio::test]
async fn test_unreachable_check_is_recorded() {
    let env = Env::new(&closed_url());
    let out = env.run(&["update", "--check-only"]).await;
    assert_eq!(out.status.code(), Some(5));

    let record = recorded(&env.paths().status_file).expect("status written");
    assert_eq!(record.state, AppState::Stopped);
    let cycle = record.last_cycle.expect("cycle recorded");
    assert_eq!(cycle.outcome, "check_failed");

    // Instance lock released on exit
    assert!(!env.paths().pid_file.exists());

    // version-check hits the same unreachable source but still shows the record
    let out = env.run(&["version-check"]).await;
    assert_eq!(out.status.code(), Some(5));
    let text = stdout(&out);
    assert!(text.contains(&cycle.message), "stdout: {}", text);
    assert!(!text.contains("none recorded"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_version_check_against_server() {
    let addr = serve_version("99.0.0\n").await;
    let env = Env::new(&format!("http://{}/version", addr));

    let out = env.run(&["version-check"]).await;
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let text = stdout(&out);
    assert!(text.contains("99.0.0"));
    assert!(text.contains("update available"));
    assert!(text.contains("none recorded"));

    let out = env.run(&["update", "--check-only"]).await;
    assert!(out.status.success());
    let record = recorded(&env.paths().status_file).unwrap();
    let cycle = record.last_cycle.unwrap();
    assert_eq!(cycle.outcome, "update_available");
    assert_eq!(record.installed_version, Version::current());

    // Last outcome is reported verbatim
    let out = env.run(&["version-check"]).await;
    assert!(stdout(&out).contains(&cycle.message));
}

#[tokio::test]
async fn test_update_while_another_update_holds_the_lock() {
    let env = Env::new(&closed_url());
    let paths = env.paths();

    // This test process plays a one-shot update: live lock, stopped record
    let _held = PidLock::acquire(&paths.pid_file).unwrap();
    StatusStore::new(&paths.status_file)
        .write(&ApplicationStatus::new(AppState::Stopped, Version::current()))
        .unwrap();

    let out = env.run(&["update"]).await;
    assert_eq!(out.status.code(), Some(6));

    let out = env.run(&["status"]).await;
    assert!(out.status.success());
    assert!(stdout(&out).contains("updating"));
}
