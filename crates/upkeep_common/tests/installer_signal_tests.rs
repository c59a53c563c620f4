//! Terminal interrupts against a running package manager
//!
//! Kept alone in its own test binary: it moves this process into a new
//! process group and interrupts that whole group.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getpgrp, setpgid, Pid};
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use tempfile::TempDir;
use tokio::signal::unix::{signal, SignalKind};

use upkeep_common::installer::{AptInstaller, Artifact, Elevation, PackageInstaller};
use upkeep_common::version::Version;

fn script(temp: &TempDir, name: &str, body: &str) -> String {
    let path = temp.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ctrl_c_does_not_kill_running_installer() {
    // Handle SIGINT here instead of dying, then leave the runner's group
    let mut interrupts = signal(SignalKind::interrupt()).unwrap();
    setpgid(Pid::from_raw(0), Pid::from_raw(0)).unwrap();

    let temp = TempDir::new().unwrap();
    let done = temp.path().join("done");
    let apt = script(&temp, "apt-get", &format!("sleep 1\ntouch {}", done.display()));
    let query = script(&temp, "dpkg-query", "printf '2.0.0-1'");

    let installer = AptInstaller::new("myapp", Elevation::AsIs)
        .with_program(apt)
        .with_query_program(query);
    let install = tokio::spawn(async move {
        installer
            .run_installer(Artifact::repository(Version::new(2, 0, 0)))
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    killpg(getpgrp(), Signal::SIGINT).unwrap();
    tokio::time::timeout(Duration::from_secs(5), interrupts.recv())
        .await
        .expect("interrupt delivered to this process");

    let outcome = install.await.unwrap();
    assert!(outcome.is_ok(), "installer interrupted: {:?}", outcome);
    assert!(done.exists());
}
