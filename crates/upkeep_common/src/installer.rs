//! Package installer - download, verify, install.
//!
//! Each step is a separate call so the orchestrator can record and log the
//! phase it is in. The package manager runs to completion once started:
//! a half-applied install is worse than a late shutdown.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, InstallMethod};
use crate::error::{InstallError, UpkeepError};
use crate::process;
use crate::remote::RemoteVersionDescriptor;
use crate::version::Version;

/// Bytes of installer stderr kept in errors and logs
const STDERR_TAIL: usize = 2000;

/// A fetched artifact, or a repository reference for apt installs
///
/// Dropping it removes the private staging directory; `keep` leaves the
/// file on disk for manual recovery.
#[derive(Debug)]
pub struct Artifact {
    pub version: Version,
    path: Option<PathBuf>,
    staging: Option<TempDir>,
}

impl Artifact {
    /// Artifact in a staging directory owned by this value
    pub fn staged(version: Version, path: PathBuf, staging: TempDir) -> Self {
        Self {
            version,
            path: Some(path),
            staging: Some(staging),
        }
    }

    /// Nothing downloaded; the package manager fetches from its repository
    pub fn repository(version: Version) -> Self {
        Self {
            version,
            path: None,
            staging: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Keep the file on disk and return its location
    pub fn keep(mut self) -> Option<PathBuf> {
        if let Some(staging) = self.staging.take() {
            let _ = staging.into_path();
        }
        self.path.take()
    }
}

/// Successful install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub version: Version,
    /// Package manager that performed the install
    pub program: String,
    pub elapsed: Duration,
}

/// How package manager calls get the privileges they need
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    /// Already privileged (root), or privilege is the caller's problem
    AsIs,
    /// Prefix with `sudo -n` (never prompts)
    Sudo,
    /// Not root and sudo disabled
    Denied,
}

impl Elevation {
    pub fn resolve(use_sudo: bool) -> Self {
        if process::is_root() {
            Elevation::AsIs
        } else if use_sudo {
            Elevation::Sudo
        } else {
            Elevation::Denied
        }
    }

    fn check(self) -> Result<(), InstallError> {
        match self {
            Elevation::Denied => Err(InstallError::PrivilegeRequired(
                "not running as root and installer.use_sudo is disabled".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn command(self, program: &str) -> Command {
        match self {
            Elevation::Sudo => {
                let mut cmd = Command::new("sudo");
                cmd.arg("-n").arg(program);
                cmd
            }
            _ => Command::new(program),
        }
    }
}

/// Installs a described version of the managed package
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Step 1: put the artifact in a private location
    async fn fetch_artifact(
        &self,
        descriptor: &RemoteVersionDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Artifact, InstallError>;

    /// Step 2: non-empty and checksum checks
    async fn verify_artifact(
        &self,
        artifact: &Artifact,
        descriptor: &RemoteVersionDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(), InstallError>;

    /// Step 3: run the package manager to completion
    ///
    /// Takes the artifact so a successful install cleans it up; on failure
    /// the implementation keeps it and reports its path.
    async fn run_installer(&self, artifact: Artifact) -> Result<InstallOutcome, InstallError>;

    /// All three steps in order
    async fn install(
        &self,
        descriptor: &RemoteVersionDescriptor,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome, InstallError> {
        let artifact = self.fetch_artifact(descriptor, cancel).await?;
        if let Err(e) = self.verify_artifact(&artifact, descriptor, cancel).await {
            if let Some(path) = artifact.keep() {
                warn!(path = %path.display(), "Artifact kept after failed verification");
            }
            return Err(e);
        }
        self.run_installer(artifact).await
    }
}

/// Build the installer described by config
pub fn from_config(config: &Config, installed: &Version) -> Result<Box<dyn PackageInstaller>, UpkeepError> {
    let elevation = Elevation::resolve(config.installer.use_sudo);
    match config.installer.method {
        InstallMethod::Dpkg => {
            let mut deb = DebInstaller::new(
                &config.app.name,
                config.download_timeout(),
                &config.user_agent(&installed.to_string()),
                elevation,
            )?;
            if config.installer.repair_dependencies {
                deb = deb.with_dependency_repair("apt-get");
            }
            Ok(Box::new(deb))
        }
        InstallMethod::Apt => Ok(Box::new(AptInstaller::new(&config.app.name, elevation))),
    }
}

/// Downloads a .deb and installs it with `dpkg -i`
#[derive(Debug, Clone)]
pub struct DebInstaller {
    client: reqwest::Client,
    package: String,
    timeout: Duration,
    elevation: Elevation,
    program: String,
    /// apt-get used for `install -f` after a failed `dpkg -i`
    repair: Option<String>,
}

impl DebInstaller {
    pub fn new(
        package: &str,
        timeout: Duration,
        user_agent: &str,
        elevation: Elevation,
    ) -> Result<Self, UpkeepError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| UpkeepError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            package: package.to_string(),
            timeout,
            elevation,
            program: "dpkg".to_string(),
            repair: None,
        })
    }

    /// Use a different `dpkg` executable
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Run `apt-get install -f -y` with `program` when `dpkg -i` fails,
    /// e.g. because the new version pulls in a dependency
    pub fn with_dependency_repair(mut self, program: impl Into<String>) -> Self {
        self.repair = Some(program.into());
        self
    }

    /// Ok when the repair completed the pending install
    async fn repair_dependencies(&self, program: &str) -> Result<(), InstallError> {
        warn!(package = %self.package, "dpkg failed, attempting dependency repair");
        let mut cmd = self.elevation.command(program);
        cmd.args(["install", "-f", "-y"])
            .env("DEBIAN_FRONTEND", "noninteractive");
        run_package_manager(program, cmd).await
    }

    fn file_name(&self, descriptor: &RemoteVersionDescriptor) -> String {
        artifact_file_name(&descriptor.artifact_url)
            .unwrap_or_else(|| format!("{}_{}.deb", self.package, descriptor.version))
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64, InstallError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| InstallError::DownloadFailed(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(InstallError::DownloadFailed(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| InstallError::DownloadFailed(format!("{}: {}", dest.display(), e)))?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| InstallError::DownloadFailed(format!("{}: {}", url, e)))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| InstallError::DownloadFailed(format!("{}: {}", dest.display(), e)))?;
            written += chunk.len() as u64;
        }
        file.sync_all()
            .await
            .map_err(|e| InstallError::DownloadFailed(format!("{}: {}", dest.display(), e)))?;
        Ok(written)
    }

    async fn fetch_checksum_list(&self, url: &str) -> Result<String, InstallError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| InstallError::IntegrityCheckFailed(format!("checksum list {}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(InstallError::IntegrityCheckFailed(format!(
                "checksum list {} returned {}",
                url,
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| InstallError::IntegrityCheckFailed(format!("checksum list {}: {}", url, e)))
    }

    /// Expected digest from the descriptor, or from its checksum list
    async fn expected_digest(
        &self,
        artifact_name: &str,
        descriptor: &RemoteVersionDescriptor,
    ) -> Result<Option<String>, InstallError> {
        if let Some(sha) = &descriptor.sha256 {
            return Ok(Some(sha.to_ascii_lowercase()));
        }
        let Some(url) = &descriptor.checksum_url else {
            return Ok(None);
        };
        let sums = self.fetch_checksum_list(url).await?;
        lookup_checksum(&sums, artifact_name).map(Some).ok_or_else(|| {
            InstallError::IntegrityCheckFailed(format!("checksum not found for {}", artifact_name))
        })
    }
}

#[async_trait]
impl PackageInstaller for DebInstaller {
    async fn fetch_artifact(
        &self,
        descriptor: &RemoteVersionDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Artifact, InstallError> {
        self.elevation.check()?;

        // TempDir is created 0700
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-update-", self.package))
            .tempdir()
            .map_err(|e| InstallError::DownloadFailed(format!("staging directory: {}", e)))?;
        let dest = staging.path().join(self.file_name(descriptor));

        info!(url = %descriptor.artifact_url, version = %descriptor.version, "Downloading artifact");
        let size = tokio::select! {
            _ = cancel.cancelled() => return Err(InstallError::Cancelled),
            res = tokio::time::timeout(self.timeout, self.download(&descriptor.artifact_url, &dest)) => {
                match res {
                    Ok(size) => size?,
                    Err(_) => {
                        return Err(InstallError::DownloadFailed(format!(
                            "timed out after {}s",
                            self.timeout.as_secs()
                        )))
                    }
                }
            }
        };
        debug!(path = %dest.display(), bytes = size, "Artifact downloaded");

        Ok(Artifact::staged(descriptor.version.clone(), dest, staging))
    }

    async fn verify_artifact(
        &self,
        artifact: &Artifact,
        descriptor: &RemoteVersionDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(), InstallError> {
        let path = artifact
            .path()
            .ok_or_else(|| InstallError::IntegrityCheckFailed("no artifact to verify".to_string()))?;

        let size = std::fs::metadata(path)
            .map_err(|e| InstallError::IntegrityCheckFailed(format!("{}: {}", path.display(), e)))?
            .len();
        if size == 0 {
            return Err(InstallError::IntegrityCheckFailed(format!(
                "{} is empty",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let expected = tokio::select! {
            _ = cancel.cancelled() => return Err(InstallError::Cancelled),
            res = self.expected_digest(&name, descriptor) => res?,
        };

        // TODO: verify a detached signature once releases publish one;
        // integrity today is size plus optional SHA-256 only
        match expected {
            Some(expected) => {
                let actual = sha256_file(path).map_err(|e| {
                    InstallError::IntegrityCheckFailed(format!("{}: {}", path.display(), e))
                })?;
                if actual != expected {
                    return Err(InstallError::IntegrityCheckFailed(format!(
                        "checksum mismatch for {}: expected {}, got {}",
                        name, expected, actual
                    )));
                }
                debug!(sha256 = %actual, "Checksum verified");
            }
            None => warn!(artifact = %name, "No checksum published, verified size only"),
        }
        Ok(())
    }

    async fn run_installer(&self, artifact: Artifact) -> Result<InstallOutcome, InstallError> {
        self.elevation.check()?;
        let path = artifact
            .path()
            .ok_or_else(|| InstallError::DownloadFailed("artifact missing".to_string()))?
            .to_path_buf();

        let mut cmd = self.elevation.command(&self.program);
        cmd.arg("-i").arg(&path);

        let started = Instant::now();
        match run_package_manager(&self.program, cmd).await {
            Ok(()) => Ok(InstallOutcome {
                version: artifact.version.clone(),
                program: self.program.clone(),
                elapsed: started.elapsed(),
            }),
            Err(InstallError::InstallerExitedNonZero {
                program,
                code,
                mut stderr,
                ..
            }) => {
                if let Some(repair) = &self.repair {
                    match self.repair_dependencies(repair).await {
                        Ok(()) => {
                            info!(package = %self.package, "Install completed by dependency repair");
                            return Ok(InstallOutcome {
                                version: artifact.version.clone(),
                                program: self.program.clone(),
                                elapsed: started.elapsed(),
                            });
                        }
                        Err(e) => stderr.push_str(&format!("\ndependency repair failed: {}", e)),
                    }
                }
                let kept = artifact.keep();
                Err(InstallError::InstallerExitedNonZero {
                    program,
                    code,
                    stderr,
                    artifact: kept,
                })
            }
            Err(e) => {
                if let Some(path) = artifact.keep() {
                    warn!(path = %path.display(), "Artifact kept after failed install");
                }
                Err(e)
            }
        }
    }
}

/// Installs from a configured apt repository
#[derive(Debug, Clone)]
pub struct AptInstaller {
    package: String,
    elevation: Elevation,
    program: String,
    query_program: String,
}

impl AptInstaller {
    pub fn new(package: &str, elevation: Elevation) -> Self {
        Self {
            package: package.to_string(),
            elevation,
            program: "apt-get".to_string(),
            query_program: "dpkg-query".to_string(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Use a different `dpkg-query` for the post-install version check
    pub fn with_query_program(mut self, program: impl Into<String>) -> Self {
        self.query_program = program.into();
        self
    }

    fn apt(&self, args: &[&str]) -> Command {
        let mut cmd = self.elevation.command(&self.program);
        cmd.args(args).env("DEBIAN_FRONTEND", "noninteractive");
        cmd
    }
}

#[async_trait]
impl PackageInstaller for AptInstaller {
    async fn fetch_artifact(
        &self,
        descriptor: &RemoteVersionDescriptor,
        _cancel: &CancellationToken,
    ) -> Result<Artifact, InstallError> {
        self.elevation.check()?;
        Ok(Artifact::repository(descriptor.version.clone()))
    }

    async fn verify_artifact(
        &self,
        _artifact: &Artifact,
        _descriptor: &RemoteVersionDescriptor,
        _cancel: &CancellationToken,
    ) -> Result<(), InstallError> {
        // apt checks repository signatures itself
        Ok(())
    }

    async fn run_installer(&self, artifact: Artifact) -> Result<InstallOutcome, InstallError> {
        self.elevation.check()?;
        let started = Instant::now();
        run_package_manager(&self.program, self.apt(&["update"])).await?;
        run_package_manager(&self.program, self.apt(&["install", "-y", &self.package])).await?;

        // apt installs the repository candidate, which need not be the
        // version the source announced
        let found = query_installed_with(&self.query_program, &self.package).await;
        if found.as_ref() != Some(&artifact.version) {
            return Err(InstallError::NotApplied {
                expected: artifact.version,
                found,
            });
        }
        Ok(InstallOutcome {
            version: artifact.version,
            program: self.program.clone(),
            elapsed: started.elapsed(),
        })
    }
}

/// Version of `package` according to dpkg, if it is installed
pub async fn query_installed(package: &str) -> Option<Version> {
    query_installed_with("dpkg-query", package).await
}

async fn query_installed_with(program: &str, package: &str) -> Option<Version> {
    let output = Command::new(program)
        .args(["-W", "-f=${Version}", package])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let raw = String::from_utf8_lossy(&output.stdout);
    match Version::parse(debian_upstream(raw.trim())) {
        Ok(version) => Some(version),
        Err(e) => {
            debug!(package, "Ignoring dpkg version '{}': {}", raw.trim(), e);
            None
        }
    }
}

/// Upstream part of a Debian version: `1:2.0.0-1` -> `2.0.0`
pub fn debian_upstream(version: &str) -> &str {
    let without_epoch = version.split_once(':').map_or(version, |(_, rest)| rest);
    without_epoch
        .rsplit_once('-')
        .map_or(without_epoch, |(upstream, _)| upstream)
}

/// Run a package manager command to completion, capturing output
async fn run_package_manager(program: &str, mut cmd: Command) -> Result<(), InstallError> {
    // Own process group: a terminal Ctrl-C aimed at us must not reach dpkg
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    info!(program, "Running package manager");
    let output = cmd.output().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            InstallError::PrivilegeRequired(format!("{}: {}", program, e))
        } else {
            InstallError::InstallerExitedNonZero {
                program: program.to_string(),
                code: None,
                stderr: format!("failed to start: {}", e),
                artifact: None,
            }
        }
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        debug!(program, "{}", stdout.trim());
    }

    if output.status.success() {
        return Ok(());
    }

    let stderr = tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL);
    warn!(program, code = ?output.status.code(), "Package manager failed: {}", stderr.trim());
    Err(InstallError::InstallerExitedNonZero {
        program: program.to_string(),
        code: output.status.code(),
        stderr,
        artifact: None,
    })
}

fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Last path segment of a URL, without query or fragment
fn artifact_file_name(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|n| !n.is_empty() && !n.contains(':'))
        .map(|n| n.to_string())
}

/// Find the digest for `name` in a `sha256sum`-style listing
pub fn lookup_checksum(sums: &str, name: &str) -> Option<String> {
    sums.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let digest = fields.next()?;
        let file = fields.next()?.trim_start_matches('*');
        (file == name).then(|| digest.to_ascii_lowercase())
    })
}

/// Hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
