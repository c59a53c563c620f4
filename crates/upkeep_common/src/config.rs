//! Configuration management for Upkeep.
//!
//! Loads settings from `$UPKEEP_CONFIG`, `/etc/upkeep/config.toml` or the
//! per-user config dir, in that order, or uses defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::UpkeepError;
use crate::paths::StatePaths;
use crate::process;

/// Environment override for the config file
pub const CONFIG_ENV: &str = "UPKEEP_CONFIG";

/// System config file path
pub const CONFIG_PATH: &str = "/etc/upkeep/config.toml";

/// Shortest accepted check interval (one second)
const MIN_CHECK_INTERVAL_HOURS: f64 = 1.0 / 3600.0;

/// Longest accepted check interval (one year)
const MAX_CHECK_INTERVAL_HOURS: f64 = 24.0 * 366.0;

/// Where the latest version is published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Plain-text (or small JSON) version file, no API rate limits
    VersionFile,
    /// GitHub "latest release" API
    GithubReleases,
}

/// How packages get installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMethod {
    /// Download the .deb and run `dpkg -i`
    Dpkg,
    /// `apt-get install` from a configured repository
    Apt,
}

/// Managed application
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Package name, also used for state paths and the User-Agent
    pub name: String,
    /// Override for the persisted-state directory
    pub state_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "upkeep".to_string(),
            state_dir: None,
        }
    }
}

/// Update checking policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// How often the scheduler ticks
    pub check_interval_hours: f64,
    /// Install automatically on scheduled cycles (notify only when false)
    pub auto_update: bool,
    /// Never install, only report
    pub notify_only: bool,
    pub source: SourceKind,
    /// `owner/repo` used by the URL defaults
    pub repository: String,
    pub version_url: Option<String>,
    pub releases_url: Option<String>,
    /// Artifact URL when the descriptor carries none.
    /// Placeholders: {owner} {repo} {name} {version}
    pub artifact_url_template: String,
    pub check_timeout_secs: u64,
    pub download_timeout_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            check_interval_hours: 1.0,
            auto_update: true,
            notify_only: false,
            source: SourceKind::VersionFile,
            repository: "upkeep-project/upkeep".to_string(),
            version_url: None,
            releases_url: None,
            artifact_url_template:
                "https://github.com/{owner}/{repo}/releases/download/v{version}/{name}_{version}-1_all.deb"
                    .to_string(),
            check_timeout_secs: 10,
            download_timeout_secs: 300,
        }
    }
}

/// Installer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub method: InstallMethod,
    /// Prefix package manager calls with `sudo -n` when not root
    pub use_sudo: bool,
    /// Run `apt-get install -f` when `dpkg -i` fails on missing dependencies
    pub repair_dependencies: bool,
    /// Command run after a successful install, e.g. to restart the app.
    /// Empty means none.
    pub post_install: Vec<String>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            method: InstallMethod::Dpkg,
            use_sudo: true,
            repair_dependencies: true,
            post_install: Vec::new(),
        }
    }
}

/// Daemon lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// How long `stop` waits for the daemon to exit
    pub stop_timeout_secs: u64,
    /// How long `start` waits for the daemon to take its lock
    pub start_timeout_secs: u64,
    /// Send desktop notifications via notify-send
    pub desktop_notifications: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 30,
            start_timeout_secs: 5,
            desktop_notifications: true,
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub update: UpdateConfig,
    pub installer: InstallerConfig,
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load config from the first existing location, defaults otherwise
    ///
    /// A file that exists but does not parse or validate is an error.
    pub fn load() -> Result<Self, UpkeepError> {
        for path in Self::candidate_paths() {
            if path.exists() {
                return Self::load_from_path(&path);
            }
        }
        warn!("Config not found, using defaults");
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Load config from specific path
    pub fn load_from_path(path: &Path) -> Result<Self, UpkeepError> {
        let content = fs::read_to_string(path)
            .map_err(|e| UpkeepError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_toml(&content)
            .map_err(|e| UpkeepError::Config(format!("{}: {}", path.display(), e)))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml(content: &str) -> Result<Self, UpkeepError> {
        let config: Config =
            toml::from_str(content).map_err(|e| UpkeepError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(env_path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
            paths.push(PathBuf::from(env_path));
        }
        paths.push(PathBuf::from(CONFIG_PATH));
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("upkeep").join("config.toml"));
        }
        paths
    }

    pub fn validate(&self) -> Result<(), UpkeepError> {
        let hours = self.update.check_interval_hours;
        if !hours.is_finite() || hours <= 0.0 {
            return Err(UpkeepError::Config(format!(
                "update.check_interval_hours must be positive, got {}",
                hours
            )));
        }
        if !(MIN_CHECK_INTERVAL_HOURS..=MAX_CHECK_INTERVAL_HOURS).contains(&hours) {
            return Err(UpkeepError::Config(format!(
                "update.check_interval_hours must be between one second and one year, got {}",
                hours
            )));
        }
        if self.app.name.is_empty() || self.app.name.contains('/') {
            return Err(UpkeepError::Config(format!(
                "app.name '{}' is not a valid package name",
                self.app.name
            )));
        }
        if self.update.version_url.is_none() || self.update.releases_url.is_none() {
            self.owner_repo()?;
        }
        if self.update.check_timeout_secs == 0 || self.update.download_timeout_secs == 0 {
            return Err(UpkeepError::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    fn owner_repo(&self) -> Result<(&str, &str), UpkeepError> {
        match self.update.repository.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {
                Ok((owner, repo))
            }
            _ => Err(UpkeepError::Config(format!(
                "update.repository must be owner/repo, got '{}'",
                self.update.repository
            ))),
        }
    }

    /// Scheduler period, clamped to the accepted range
    pub fn check_interval(&self) -> Duration {
        let hours = self
            .update
            .check_interval_hours
            .clamp(MIN_CHECK_INTERVAL_HOURS, MAX_CHECK_INTERVAL_HOURS);
        Duration::try_from_secs_f64(hours * 3600.0).unwrap_or(Duration::from_secs(3600))
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.update.check_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.update.download_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.stop_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.start_timeout_secs)
    }

    /// URL of the version file
    pub fn version_url(&self) -> String {
        if let Some(url) = &self.update.version_url {
            return url.clone();
        }
        let (owner, repo) = self.owner_repo().unwrap_or(("", ""));
        format!(
            "https://raw.githubusercontent.com/{}/{}/main/latest-version.txt",
            owner, repo
        )
    }

    /// URL of the latest-release API
    pub fn releases_url(&self) -> String {
        if let Some(url) = &self.update.releases_url {
            return url.clone();
        }
        let (owner, repo) = self.owner_repo().unwrap_or(("", ""));
        format!("https://api.github.com/repos/{}/{}/releases/latest", owner, repo)
    }

    /// Artifact URL for a version, from the template
    pub fn artifact_url(&self, version: &str) -> String {
        let (owner, repo) = self.owner_repo().unwrap_or(("", ""));
        self.update
            .artifact_url_template
            .replace("{owner}", owner)
            .replace("{repo}", repo)
            .replace("{name}", &self.app.name)
            .replace("{version}", version)
    }

    /// Whether package manager calls need a `sudo -n` prefix
    pub fn needs_sudo(&self) -> bool {
        self.installer.use_sudo && !process::is_root()
    }

    /// State file layout for this config
    pub fn state_paths(&self) -> StatePaths {
        StatePaths::resolve(&self.app.name, self.app.state_dir.as_deref())
    }

    /// User-Agent sent with every request
    pub fn user_agent(&self, installed: &str) -> String {
        format!("{}/{}", self.app.name, installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.update.check_interval_hours, 1.0);
        assert!(config.update.auto_update);
        assert!(!config.update.notify_only);
        assert_eq!(config.installer.method, InstallMethod::Dpkg);
        assert_eq!(config.check_interval(), Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [app]
            name = "myapp"

            [update]
            check_interval_hours = 0.5
            notify_only = true
            source = "github_releases"
            repository = "rabbularafat/myapp"
            "#,
        )
        .unwrap();
        assert_eq!(config.app.name, "myapp");
        assert_eq!(config.check_interval(), Duration::from_secs(1800));
        assert!(config.update.notify_only);
        assert_eq!(config.update.source, SourceKind::GithubReleases);
        assert_eq!(config.update.download_timeout_secs, 300);
        assert_eq!(
            config.releases_url(),
            "https://api.github.com/repos/rabbularafat/myapp/releases/latest"
        );
    }

    #[test]
    fn test_rejects_bad_interval() {
        let err = Config::from_toml("[update]\ncheck_interval_hours = 0\n").unwrap_err();
        assert!(err.to_string().contains("check_interval_hours"));
        assert!(Config::from_toml("[update]\ncheck_interval_hours = -2.0\n").is_err());
    }

    #[test]
    fn test_rejects_interval_outside_range() {
        let tiny = Config::from_toml("[update]\ncheck_interval_hours = 1e-20\n").unwrap_err();
        assert!(tiny.to_string().contains("between one second and one year"));
        assert!(Config::from_toml("[update]\ncheck_interval_hours = 1e16\n").is_err());

        let short = Config::from_toml("[update]\ncheck_interval_hours = 0.001\n").unwrap();
        let interval = short.check_interval();
        assert!(interval > Duration::from_millis(3599) && interval < Duration::from_millis(3601));
        assert!(Config::from_toml("[update]\ncheck_interval_hours = 8760\n").is_ok());
    }

    #[test]
    fn test_interval_never_zero_without_validation() {
        let mut config = Config::default();
        config.update.check_interval_hours = 1e-20;
        assert!(config.check_interval() > Duration::ZERO);
        config.update.check_interval_hours = 1e16;
        assert_eq!(config.check_interval(), Duration::from_secs(366 * 24 * 3600));
        config.update.check_interval_hours = f64::NAN;
        assert_eq!(config.check_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_installer_hooks() {
        let config = Config::from_toml(
            "[installer]\nrepair_dependencies = false\npost_install = [\"systemctl\", \"restart\", \"myapp\"]\n",
        )
        .unwrap();
        assert!(!config.installer.repair_dependencies);
        assert_eq!(config.installer.post_install, ["systemctl", "restart", "myapp"]);
        assert!(Config::default().installer.repair_dependencies);
        assert!(Config::default().installer.post_install.is_empty());
    }

    #[test]
    fn test_rejects_bad_repository() {
        assert!(Config::from_toml("[update]\nrepository = \"no-slash\"\n").is_err());
        // Explicit URLs make the repository irrelevant
        assert!(Config::from_toml(
            "[update]\nrepository = \"x\"\nversion_url = \"http://a/v\"\nreleases_url = \"http://a/r\"\n"
        )
        .is_ok());
    }

    #[test]
    fn test_artifact_url_template() {
        let mut config = Config::default();
        config.app.name = "myapp".to_string();
        config.update.repository = "rabbularafat/myapp".to_string();
        assert_eq!(
            config.artifact_url("2.0.0"),
            "https://github.com/rabbularafat/myapp/releases/download/v2.0.0/myapp_2.0.0-1_all.deb"
        );
    }

    #[test]
    fn test_load_from_path() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[daemon]\nstop_timeout_secs = 5\n").unwrap();
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.daemon.stop_timeout_secs, 5);

        fs::write(&path, "[daemon\n").unwrap();
        assert!(Config::load_from_path(&path).is_err());
    }
}
