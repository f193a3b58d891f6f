use crate::{runtime::ImageRef, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the suite configuration file, also used as the codebase anchor
/// inside snapshots
pub const SUITE_CONFIG_FILE: &str = "wpassure.json";

/// Per-suite configuration read from `wpassure.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// Project name, matched against the codebase anchor inside the snapshot
    pub name: String,

    /// Repository root bound into the application container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,

    /// Globs selecting test files, relative to `path`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<String>,

    /// Skip taking and restoring the clean database copy
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_clean_db: bool,

    /// Keys this crate doesn't interpret, kept so `save` doesn't lose them
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SuiteConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            snapshot_id: None,
            tests: Vec::new(),
            disable_clean_db: false,
            extra: serde_json::Map::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read a config file. A missing `path` defaults to the file's directory.
    pub fn load(file: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(file)?;
        let mut config = Self::from_json(&content)?;
        if config.path.is_none() {
            config.path = file.parent().map(Path::to_path_buf);
        }
        Ok(config)
    }

    pub fn save(&self, file: &Path) -> Result<()> {
        std::fs::write(file, self.to_json()? + "\n")?;
        Ok(())
    }

    /// Find `wpassure.json` in `start` or the nearest ancestor and load it
    pub fn discover(start: &Path) -> Result<Self> {
        let file = start
            .ancestors()
            .map(|dir| dir.join(SUITE_CONFIG_FILE))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                Error::Config(format!(
                    "no {} found in {} or its parents",
                    SUITE_CONFIG_FILE,
                    start.display()
                ))
            })?;
        Self::load(&file)
    }

    /// Repository root, falling back to the current directory
    pub fn repository_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("suite name must not be empty".into()));
        }
        Ok(())
    }
}

/// Credentials baked into the database container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseCredentials {
    pub host: String,
    pub user: String,
    pub password: String,
    pub name: String,
}

/// Tunables for provisioning environments
#[derive(Debug, Clone)]
pub struct EnvironmentSettings {
    /// Prefix for network and container names
    pub name_prefix: String,
    pub database_image: ImageRef,
    pub application_image: ImageRef,
    /// Directory with a Dockerfile for the application image. The embedded
    /// Dockerfile is used when unset.
    pub application_build_context: Option<PathBuf>,
    /// Rebuild the application image even if it already exists
    pub rebuild_images: bool,
    pub browser_image: ImageRef,
    /// Host interface probed when allocating ports
    pub port_host: String,
    pub port_range: (u16, u16),
    /// Hostname WordPress is served under inside the environment
    pub test_hostname: String,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    /// Regex matched against database output to detect readiness
    pub readiness_marker: String,
    pub readiness_attempts: u32,
    pub readiness_interval: Duration,
    pub web_root: String,
    pub repository_mount: String,
    pub snapshots_mount: String,
    /// Host directory holding cached snapshots
    pub snapshots_dir: PathBuf,
    pub codebase_marker: String,
    /// Directory names never searched for the codebase anchor
    pub excluded_dirs: Vec<String>,
    pub update_snapshot_tool: bool,
    pub snapshot_tool_update: Vec<String>,
    pub stop_timeout: Duration,
    /// Leave containers and network behind for inspection
    pub preserve_containers: bool,
    /// Where the clean database dump lives inside the application container
    pub clean_db_dump: String,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        let snapshots_dir = std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".wpsnapshots"))
            .unwrap_or_else(|| std::env::temp_dir().join("wpsnapshots"));

        Self {
            name_prefix: "wpassure".to_string(),
            database_image: ImageRef::new("mysql", "5.7"),
            application_image: ImageRef::new("wpassure/wordpress", "latest"),
            application_build_context: None,
            rebuild_images: false,
            browser_image: ImageRef::new("selenium/standalone-chrome", "3.141.59"),
            port_host: "127.0.0.1".to_string(),
            port_range: (1000, 9999),
            test_hostname: "wpassure.test".to_string(),
            db_user: "root".to_string(),
            db_password: "password".to_string(),
            db_name: "wordpress".to_string(),
            readiness_marker: r"Version: .*port: 3306".to_string(),
            readiness_attempts: 15,
            readiness_interval: Duration::from_secs(1),
            web_root: "/var/www/html".to_string(),
            repository_mount: "/root/repo".to_string(),
            snapshots_mount: "/root/.wpsnapshots".to_string(),
            snapshots_dir,
            codebase_marker: SUITE_CONFIG_FILE.to_string(),
            excluded_dirs: ["node_modules", "vendor", "wp-admin", "wp-includes", ".git"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            update_snapshot_tool: true,
            snapshot_tool_update: ["composer", "global", "update", "10up/wpsnapshots"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            stop_timeout: Duration::from_secs(5),
            preserve_containers: false,
            clean_db_dump: "/root/wpassure-clean-db.sql".to_string(),
        }
    }
}

impl EnvironmentSettings {
    /// Defaults with `WPASSURE_*` environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(prefix) = var("WPASSURE_NAME_PREFIX") {
            self.name_prefix = prefix;
        }
        if let Some(image) = var("WPASSURE_DATABASE_IMAGE") {
            self.database_image = ImageRef::parse(&image);
        }
        if let Some(image) = var("WPASSURE_APPLICATION_IMAGE") {
            self.application_image = ImageRef::parse(&image);
        }
        if let Some(dir) = var("WPASSURE_APPLICATION_BUILD_CONTEXT") {
            self.application_build_context = Some(PathBuf::from(dir));
        }
        if let Some(image) = var("WPASSURE_BROWSER_IMAGE") {
            self.browser_image = ImageRef::parse(&image);
        }
        if let Some(dir) = var("WPASSURE_SNAPSHOTS_DIR") {
            self.snapshots_dir = PathBuf::from(dir);
        }
        if let Some(range) = var("WPASSURE_PORT_RANGE") {
            self.port_range = parse_port_range(&range)?;
        }
        if let Some(attempts) = var("WPASSURE_READINESS_ATTEMPTS") {
            self.readiness_attempts = attempts.parse().map_err(|_| {
                Error::Config(format!("WPASSURE_READINESS_ATTEMPTS={}", attempts))
            })?;
        }
        self.rebuild_images |= var("WPASSURE_REBUILD_IMAGES").is_some();
        self.preserve_containers |= var("WPASSURE_PRESERVE_CONTAINERS").is_some();
        if var("WPASSURE_SKIP_SNAPSHOT_UPDATE").is_some() {
            self.update_snapshot_tool = false;
        }
        Ok(())
    }

    /// Database credentials as seen from inside the environment network
    pub fn database_credentials(&self, network_id: &str) -> DatabaseCredentials {
        DatabaseCredentials {
            host: format!("{}-{}", crate::ServiceRole::Database.as_str(), network_id),
            user: self.db_user.clone(),
            password: self.db_password.clone(),
            name: self.db_name.clone(),
        }
    }
}

fn parse_port_range(range: &str) -> Result<(u16, u16)> {
    let invalid = || Error::Config(format!("invalid port range {:?}", range));
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start: u16 = start.trim().parse().map_err(|_| invalid())?;
    let end: u16 = end.trim().parse().map_err(|_| invalid())?;
    if start > end {
        return Err(invalid());
    }
    Ok((start, end))
}
