//! Remote version source - where the latest published version comes from.
//!
//! One bounded request per check, no internal retry; the orchestrator's next
//! cycle is the retry.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{Config, SourceKind};
use crate::error::{CheckError, UpkeepError};
use crate::version::Version;

/// Latest published version plus where to get it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVersionDescriptor {
    pub version: Version,
    pub artifact_url: String,
    /// Expected SHA-256 of the artifact (hex)
    pub sha256: Option<String>,
    /// URL of a `SHA256SUMS` file covering the artifact
    pub checksum_url: Option<String>,
}

impl RemoteVersionDescriptor {
    /// Descriptor with only a version and artifact URL
    pub fn new(version: Version, artifact_url: impl Into<String>) -> Self {
        Self {
            version,
            artifact_url: artifact_url.into(),
            sha256: None,
            checksum_url: None,
        }
    }
}

/// Anything that can report the latest published version
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<RemoteVersionDescriptor, CheckError>;
}

/// Structured version file body
#[derive(Debug, Deserialize)]
struct VersionFileJson {
    version: String,
    url: Option<String>,
    sha256: Option<String>,
    checksum_url: Option<String>,
}

/// GitHub API response for releases
#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
}

/// Fills `{version}` in an artifact URL template
///
/// Other placeholders are resolved from config up front.
#[derive(Debug, Clone)]
pub struct ArtifactTemplate(String);

impl ArtifactTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn from_config(config: &Config) -> Self {
        Self(config.artifact_url("{version}"))
    }

    pub fn render(&self, version: &Version) -> String {
        self.0.replace("{version}", &version.to_string())
    }
}

/// HTTP(S) version source
#[derive(Debug, Clone)]
pub struct HttpVersionSource {
    client: reqwest::Client,
    url: String,
    kind: SourceKind,
    timeout: Duration,
    template: ArtifactTemplate,
}

impl HttpVersionSource {
    pub fn new(
        url: impl Into<String>,
        kind: SourceKind,
        timeout: Duration,
        template: ArtifactTemplate,
        user_agent: &str,
    ) -> Result<Self, UpkeepError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| UpkeepError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            kind,
            timeout,
            template,
        })
    }

    /// Source described by config, identifying as `<name>/<installed>`
    pub fn from_config(config: &Config, installed: &Version) -> Result<Self, UpkeepError> {
        let url = match config.update.source {
            SourceKind::VersionFile => config.version_url(),
            SourceKind::GithubReleases => config.releases_url(),
        };
        Self::new(
            url,
            config.update.source,
            config.check_timeout(),
            ArtifactTemplate::from_config(config),
            &config.user_agent(&installed.to_string()),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_body(&self) -> Result<String, CheckError> {
        let mut request = self.client.get(&self.url);
        if self.kind == SourceKind::GithubReleases {
            request = request.header(reqwest::header::ACCEPT, "application/vnd.github+json");
        }

        let response = request.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CheckError::Unreachable(format!("{} returned {}", self.url, status)));
        }
        response.text().await.map_err(|e| self.classify(e))
    }

    fn classify(&self, e: reqwest::Error) -> CheckError {
        if e.is_timeout() {
            CheckError::Timeout(self.timeout)
        } else if e.is_decode() {
            CheckError::MalformedResponse(e.to_string())
        } else {
            CheckError::Unreachable(format!("{}: {}", self.url, e))
        }
    }
}

#[async_trait]
impl VersionSource for HttpVersionSource {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<RemoteVersionDescriptor, CheckError> {
        debug!(url = %self.url, "Fetching latest version");
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(CheckError::Cancelled),
            res = tokio::time::timeout(self.timeout, self.fetch_body()) => match res {
                Ok(body) => body?,
                Err(_) => return Err(CheckError::Timeout(self.timeout)),
            },
        };

        match self.kind {
            SourceKind::VersionFile => parse_version_file(&body, &self.template),
            SourceKind::GithubReleases => parse_github_release(&body, &self.template),
        }
    }
}

/// Parse a version file body: one version string, or a small JSON object
pub fn parse_version_file(
    body: &str,
    template: &ArtifactTemplate,
) -> Result<RemoteVersionDescriptor, CheckError> {
    if body.trim_start().starts_with('{') {
        let doc: VersionFileJson = serde_json::from_str(body)
            .map_err(|e| CheckError::MalformedResponse(format!("version document: {}", e)))?;
        let version = parse_remote_version(&doc.version)?;
        let artifact_url = doc.url.unwrap_or_else(|| template.render(&version));
        return Ok(RemoteVersionDescriptor {
            version,
            artifact_url,
            sha256: doc.sha256,
            checksum_url: doc.checksum_url,
        });
    }

    // Exactly one trailing newline is tolerated
    let text = body
        .strip_suffix("\r\n")
        .or_else(|| body.strip_suffix('\n'))
        .unwrap_or(body);
    let version = parse_remote_version(text)?;
    let artifact_url = template.render(&version);
    Ok(RemoteVersionDescriptor::new(version, artifact_url))
}

/// Parse a "latest release" API response
pub fn parse_github_release(
    body: &str,
    template: &ArtifactTemplate,
) -> Result<RemoteVersionDescriptor, CheckError> {
    let release: GitHubRelease = serde_json::from_str(body)
        .map_err(|e| CheckError::MalformedResponse(format!("release document: {}", e)))?;
    let version = parse_remote_version(&release.tag_name)?;

    let artifact_url = release
        .assets
        .iter()
        .find(|a| a.name.ends_with(".deb"))
        .map(|a| a.browser_download_url.clone())
        .unwrap_or_else(|| template.render(&version));
    let checksum_url = release
        .assets
        .iter()
        .find(|a| a.name == "SHA256SUMS")
        .map(|a| a.browser_download_url.clone());

    Ok(RemoteVersionDescriptor {
        version,
        artifact_url,
        sha256: None,
        checksum_url,
    })
}

fn parse_remote_version(text: &str) -> Result<Version, CheckError> {
    Version::parse(text).map_err(|e| CheckError::MalformedResponse(e.to_string()))
}
