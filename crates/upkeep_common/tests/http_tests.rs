//! Remote checks and .deb downloads against a local HTTP server

use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use upkeep_common::config::SourceKind;
use upkeep_common::error::{CheckError, InstallError};
use upkeep_common::installer::{DebInstaller, Elevation, PackageInstaller};
use upkeep_common::remote::{ArtifactTemplate, HttpVersionSource, RemoteVersionDescriptor, VersionSource};
use upkeep_common::version::Version;

const PACKAGE: &[u8] = b"!<arch>\ndebian-binary   fake package body";

fn package_sha() -> String {
    hex::encode(Sha256::digest(PACKAGE))
}

async fn serve() -> SocketAddr {
    let sums = format!("{}  myapp_2.0.0-1_all.deb\n", package_sha());
    let app = Router::new()
        .route("/latest.txt", get(|| async { "2.0.0\n" }))
        .route("/latest.json", get(|| async { r#"{"version": "v2.1.0", "sha256": "00"}"# }))
        .route(
            "/releases/latest",
            get(|| async {
                r#"{"tag_name": "v2.0.0", "assets": [
                    {"name": "myapp_2.0.0-1_all.deb", "browser_download_url": "http://unused/myapp.deb"},
                    {"name": "SHA256SUMS", "browser_download_url": "http://unused/SHA256SUMS"}
                ]}"#
            }),
        )
        .route("/html", get(|| async { "<html>maintenance</html>" }))
        .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "not found") }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                "9.9.9"
            }),
        )
        .route(
            "/agent",
            get(|headers: HeaderMap| async move {
                match headers.get("user-agent").and_then(|v| v.to_str().ok()) {
                    Some("myapp/1.0.0") => (StatusCode::OK, "2.0.0"),
                    _ => (StatusCode::FORBIDDEN, ""),
                }
            }),
        )
        .route("/pkg/myapp_2.0.0-1_all.deb", get(|| async { PACKAGE }))
        .route("/pkg/empty.deb", get(|| async { "" }))
        .route("/pkg/SHA256SUMS", get(move || async move { sums }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn source(addr: SocketAddr, path: &str, kind: SourceKind, timeout: Duration) -> HttpVersionSource {
    HttpVersionSource::new(
        format!("http://{}{}", addr, path),
        kind,
        timeout,
        ArtifactTemplate::new(format!("http://{}/pkg/myapp_{{version}}-1_all.deb", addr)),
        "myapp/1.0.0",
    )
    .unwrap()
}

fn deb_installer(program: &str) -> DebInstaller {
    DebInstaller::new("myapp", Duration::from_secs(5), "myapp/1.0.0", Elevation::AsIs)
        .unwrap()
        .with_program(program)
}

#[tokio::test]
async fn test_plain_version_file() {
    let addr = serve().await;
    let desc = source(addr, "/latest.txt", SourceKind::VersionFile, Duration::from_secs(5))
        .fetch(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(desc.version, Version::new(2, 0, 0));
    assert_eq!(
        desc.artifact_url,
        format!("http://{}/pkg/myapp_2.0.0-1_all.deb", addr)
    );
}

#[tokio::test]
async fn test_json_version_file() {
    let addr = serve().await;
    let desc = source(addr, "/latest.json", SourceKind::VersionFile, Duration::from_secs(5))
        .fetch(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(desc.version, Version::new(2, 1, 0));
    assert_eq!(desc.sha256.as_deref(), Some("00"));
}

#[tokio::test]
async fn test_github_release() {
    let addr = serve().await;
    let desc = source(addr, "/releases/latest", SourceKind::GithubReleases, Duration::from_secs(5))
        .fetch(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(desc.version, Version::new(2, 0, 0));
    assert_eq!(desc.artifact_url, "http://unused/myapp.deb");
    assert_eq!(desc.checksum_url.as_deref(), Some("http://unused/SHA256SUMS"));
}

#[tokio::test]
async fn test_user_agent_sent() {
    let addr = serve().await;
    let desc = source(addr, "/agent", SourceKind::VersionFile, Duration::from_secs(5))
        .fetch(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(desc.version, Version::new(2, 0, 0));
}

#[tokio::test]
async fn test_failure_kinds() {
    let addr = serve().await;
    let cancel = CancellationToken::new();

    let err = source(addr, "/missing", SourceKind::VersionFile, Duration::from_secs(5))
        .fetch(&cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CheckError::Unreachable(ref m) if m.contains("404")), "{:?}", err);

    let err = source(addr, "/html", SourceKind::VersionFile, Duration::from_secs(5))
        .fetch(&cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CheckError::MalformedResponse(_)), "{:?}", err);

    let err = source(addr, "/slow", SourceKind::VersionFile, Duration::from_millis(300))
        .fetch(&cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CheckError::Timeout(_)), "{:?}", err);
}

#[tokio::test]
async fn test_connection_refused_is_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = source(addr, "/latest.txt", SourceKind::VersionFile, Duration::from_secs(5))
        .fetch(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CheckError::Unreachable(_)), "{:?}", err);
}

#[tokio::test]
async fn test_cancel_interrupts_fetch() {
    let addr = serve().await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = source(addr, "/slow", SourceKind::VersionFile, Duration::from_secs(30))
        .fetch(&cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CheckError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_download_verify_install_with_checksum_list() {
    let addr = serve().await;
    let descriptor = RemoteVersionDescriptor {
        version: Version::new(2, 0, 0),
        artifact_url: format!("http://{}/pkg/myapp_2.0.0-1_all.deb", addr),
        sha256: None,
        checksum_url: Some(format!("http://{}/pkg/SHA256SUMS", addr)),
    };
    let installer = deb_installer("true");
    let cancel = CancellationToken::new();

    let artifact = installer.fetch_artifact(&descriptor, &cancel).await.unwrap();
    let path = artifact.path().unwrap().to_path_buf();
    assert_eq!(std::fs::read(&path).unwrap(), PACKAGE);
    let staging = path.parent().unwrap().to_path_buf();

    installer
        .verify_artifact(&artifact, &descriptor, &cancel)
        .await
        .unwrap();
    let outcome = installer.run_installer(artifact).await.unwrap();
    assert_eq!(outcome.version, Version::new(2, 0, 0));

    // Cleaned up on success
    assert!(!staging.exists());
}

#[tokio::test]
async fn test_checksum_mismatch() {
    let addr = serve().await;
    let descriptor = RemoteVersionDescriptor {
        sha256: Some("0".repeat(64)),
        ..RemoteVersionDescriptor::new(
            Version::new(2, 0, 0),
            format!("http://{}/pkg/myapp_2.0.0-1_all.deb", addr),
        )
    };
    let err = deb_installer("true")
        .install(&descriptor, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, InstallError::IntegrityCheckFailed(ref m) if m.contains("mismatch")));
}

#[tokio::test]
async fn test_matching_inline_checksum() {
    let addr = serve().await;
    let descriptor = RemoteVersionDescriptor {
        sha256: Some(package_sha().to_uppercase()),
        ..RemoteVersionDescriptor::new(
            Version::new(2, 0, 0),
            format!("http://{}/pkg/myapp_2.0.0-1_all.deb", addr),
        )
    };
    deb_installer("true")
        .install(&descriptor, &CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_empty_artifact_rejected() {
    let addr = serve().await;
    let descriptor =
        RemoteVersionDescriptor::new(Version::new(2, 0, 0), format!("http://{}/pkg/empty.deb", addr));
    let err = deb_installer("true")
        .install(&descriptor, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, InstallError::IntegrityCheckFailed(ref m) if m.contains("empty")));
}

#[tokio::test]
async fn test_missing_artifact_is_download_failure() {
    let addr = serve().await;
    let descriptor =
        RemoteVersionDescriptor::new(Version::new(2, 0, 0), format!("http://{}/pkg/nope.deb", addr));
    let err = deb_installer("true")
        .install(&descriptor, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, InstallError::DownloadFailed(_)));
}

#[tokio::test]
async fn test_installer_failure_keeps_artifact() {
    let addr = serve().await;
    let descriptor = RemoteVersionDescriptor::new(
        Version::new(2, 0, 0),
        format!("http://{}/pkg/myapp_2.0.0-1_all.deb", addr),
    );
    let err = deb_installer("false")
        .install(&descriptor, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        InstallError::InstallerExitedNonZero {
            code,
            artifact: Some(path),
            ..
        } => {
            assert_eq!(code, Some(1));
            assert_eq!(std::fs::read(&path).unwrap(), PACKAGE);
            std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
        }
        other => panic!("expected InstallerExitedNonZero, got {:?}", other),
    }
}
