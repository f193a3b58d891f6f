//! Snapshot metadata, the snapshot store seam and injection of a snapshot
//! into a running application container.

use crate::{
    config::{DatabaseCredentials, EnvironmentSettings},
    logs::Reporter,
    readiness::{shell_escape, ReadinessMonitor},
    Error, Result,
};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Home and site URL of one site inside a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteMapping {
    pub home_url: String,
    pub site_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blog_id: Option<u64>,
}

/// Metadata of a stored snapshot, as written by wpsnapshots to `meta.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub multisite: bool,
    #[serde(default)]
    pub sites: Vec<SiteMapping>,
}

impl SnapshotMeta {
    /// Every site with its URLs pointed at `host` (`hostname:port`)
    pub fn site_mapping(&self, host: &str) -> Result<Vec<SiteMapping>> {
        self.sites
            .iter()
            .map(|site| {
                Ok(SiteMapping {
                    home_url: rewrite_url(&site.home_url, host)?,
                    site_url: rewrite_url(&site.site_url, host)?,
                    blog_id: site.blog_id,
                })
            })
            .collect()
    }
}

/// Replace the authority of `url` with `host`, keeping scheme, path, query
/// and fragment exactly as they were.
pub fn rewrite_url(url: &str, host: &str) -> Result<String> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
    if scheme.is_empty() {
        return Err(Error::InvalidUrl(url.to_string()));
    }
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    if authority_end == 0 {
        return Err(Error::InvalidUrl(url.to_string()));
    }
    Ok(format!("{}://{}{}", scheme, host, &rest[authority_end..]))
}

/// Storage of snapshots, outside this crate's control
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Capture the WordPress install at `path` and return the new snapshot id
    async fn create(&self, path: &Path) -> Result<String>;

    /// Metadata of a snapshot, fetching it into the local cache if needed
    async fn get(&self, id: &str) -> Result<SnapshotMeta>;

    /// Upload a locally created snapshot
    async fn push(&self, id: &str) -> Result<bool>;

    /// Whether the snapshot is present in the local cache
    async fn is_cached(&self, id: &str) -> bool;
}

/// Snapshot store backed by the host's `wpsnapshots` tool and its cache directory
#[derive(Debug, Clone)]
pub struct WpSnapshotsStore {
    cache_dir: PathBuf,
    binary: Option<PathBuf>,
}

impl WpSnapshotsStore {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            binary: None,
        }
    }

    /// Use a specific `wpsnapshots` executable instead of searching PATH
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.cache_dir.join(id).join("meta.json")
    }

    fn resolve_binary(&self) -> Result<PathBuf> {
        match &self.binary {
            Some(path) => Ok(path.clone()),
            None => which::which("wpsnapshots").map_err(|_| {
                Error::Config(
                    "wpsnapshots not found in PATH. Install with: composer global require 10up/wpsnapshots"
                        .into(),
                )
            }),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        let binary = self.resolve_binary()?;
        tracing::debug!(binary = %binary.display(), ?args, "Running wpsnapshots");

        let output = tokio::process::Command::new(&binary)
            .args(args)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            return Err(Error::Other(anyhow::anyhow!(
                "wpsnapshots {} failed: {}{}",
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr),
                stdout
            )));
        }
        Ok(stdout)
    }

    fn read_meta(&self, id: &str) -> Result<SnapshotMeta> {
        let content = std::fs::read_to_string(self.meta_path(id))?;
        let mut meta: SnapshotMeta = serde_json::from_str(&content)?;
        if meta.id.is_empty() {
            meta.id = id.to_string();
        }
        Ok(meta)
    }
}

#[async_trait]
impl SnapshotStore for WpSnapshotsStore {
    async fn create(&self, path: &Path) -> Result<String> {
        let output = self
            .run(&[
                "create".to_string(),
                format!("--path={}", path.display()),
                "--no_scrub".to_string(),
            ])
            .await?;
        parse_snapshot_id(&output).ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "wpsnapshots create did not report a snapshot id"
            ))
        })
    }

    async fn get(&self, id: &str) -> Result<SnapshotMeta> {
        if !self.is_cached(id).await {
            tracing::info!(snapshot = id, "Snapshot not cached, downloading");
            self.run(&["download".to_string(), id.to_string()])
                .await
                .map_err(|e| Error::SnapshotNotFound(format!("{}: {}", id, e)))?;
        }
        self.read_meta(id)
            .map_err(|e| Error::SnapshotNotFound(format!("{}: {}", id, e)))
    }

    async fn push(&self, id: &str) -> Result<bool> {
        match self.run(&["push".to_string(), id.to_string()]).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(snapshot = id, error = %e, "Snapshot push failed");
                Ok(false)
            }
        }
    }

    async fn is_cached(&self, id: &str) -> bool {
        self.meta_path(id).is_file()
    }
}

/// Snapshot ids are 32 hex characters; take the last one the tool printed.
fn parse_snapshot_id(output: &str) -> Option<String> {
    let pattern = Regex::new(r"\b[0-9a-f]{32}\b").ok()?;
    pattern
        .find_iter(output)
        .last()
        .map(|m| m.as_str().to_string())
}

/// Where a snapshot is injected
#[derive(Debug, Clone)]
pub struct InjectionTarget<'a> {
    pub container_id: &'a str,
    pub snapshot: &'a SnapshotMeta,
    pub application_port: u16,
    pub database: &'a DatabaseCredentials,
    /// Suite name the codebase anchor must carry
    pub project_name: &'a str,
}

/// Loads a snapshot into the application container and overlays the
/// repository under test onto the matching codebase.
pub struct SnapshotInjector<'a> {
    monitor: &'a ReadinessMonitor,
    settings: &'a EnvironmentSettings,
    reporter: &'a Reporter,
}

impl<'a> SnapshotInjector<'a> {
    pub fn new(
        monitor: &'a ReadinessMonitor,
        settings: &'a EnvironmentSettings,
        reporter: &'a Reporter,
    ) -> Self {
        Self {
            monitor,
            settings,
            reporter,
        }
    }

    /// Run the whole injection in order and return the codebase directory
    /// inside the container.
    pub async fn inject(&self, target: &InjectionTarget<'_>) -> Result<String> {
        if self.settings.update_snapshot_tool {
            self.update_tool(target.container_id).await;
        }

        let host = format!(
            "{}:{}",
            self.settings.test_hostname, target.application_port
        );
        let mapping = target.snapshot.site_mapping(&host)?;

        self.pull(target, &mapping, &host).await?;
        let codebase = self
            .locate_codebase(target.container_id, target.project_name)
            .await?;
        self.copy_repository(target.container_id, &codebase).await?;
        Ok(codebase)
    }

    /// Refresh the snapshot tool. Failure only costs freshness.
    pub async fn update_tool(&self, container_id: &str) {
        if self.settings.snapshot_tool_update.is_empty() {
            return;
        }
        self.reporter.info(1, "Updating wpsnapshots...");
        match self
            .monitor
            .exec(container_id, &self.settings.snapshot_tool_update)
            .await
        {
            Ok(output) if output.success() => {}
            Ok(output) => self.reporter.warning(
                1,
                format!("Could not update wpsnapshots: {}", output.tail(5)),
            ),
            Err(e) => self
                .reporter
                .warning(1, format!("Could not update wpsnapshots: {}", e)),
        }
    }

    /// Pull the snapshot inside the container against the environment's database
    pub async fn pull(
        &self,
        target: &InjectionTarget<'_>,
        mapping: &[SiteMapping],
        host: &str,
    ) -> Result<()> {
        let args = self.pull_args(target, mapping, host)?;
        let script = format!(
            "cd {} && {}",
            shell_escape(&self.settings.web_root),
            args.iter()
                .map(|arg| shell_escape(arg))
                .collect::<Vec<_>>()
                .join(" ")
        );

        self.reporter
            .info(0, format!("Pulling snapshot {}...", target.snapshot.id));
        let output = self
            .monitor
            .exec_shell(target.container_id, &script)
            .await
            .map_err(|e| Error::SnapshotPull(e.to_string()))?;

        let reported_error = output
            .lines
            .iter()
            .find(|line| line.trim_start().starts_with("Error:"));
        if !output.success() || reported_error.is_some() {
            return Err(Error::SnapshotPull(format!(
                "exit code {:?}: {}",
                output.exit_code,
                output.tail(10)
            )));
        }

        self.reporter
            .success(0, format!("Pulled snapshot {}", target.snapshot.id));
        Ok(())
    }

    fn pull_args(
        &self,
        target: &InjectionTarget<'_>,
        mapping: &[SiteMapping],
        host: &str,
    ) -> Result<Vec<String>> {
        let db = target.database;
        let mut args = vec![
            "wpsnapshots".to_string(),
            "pull".to_string(),
            target.snapshot.id.clone(),
            "--confirm".to_string(),
            "--confirm_wp_download".to_string(),
            "--confirm_config_create".to_string(),
            "--config_db".to_string(),
            format!("--db_host={}", db.host),
            format!("--db_name={}", db.name),
            format!("--db_user={}", db.user),
            format!("--db_password={}", db.password),
            format!("--site_mapping={}", serde_json::to_string(mapping)?),
        ];
        if target.snapshot.multisite {
            args.push(format!("--main_domain={}", host));
        }
        Ok(args)
    }

    /// Find the codebase anchor whose `name` matches `project_name` and return
    /// its directory. The first match in search order wins.
    pub async fn locate_codebase(&self, container_id: &str, project_name: &str) -> Result<String> {
        let mut find = vec![
            "find".to_string(),
            self.settings.web_root.clone(),
            "-type".to_string(),
            "f".to_string(),
            "-name".to_string(),
            self.settings.codebase_marker.clone(),
        ];
        for dir in &self.settings.excluded_dirs {
            find.push("-not".to_string());
            find.push("-path".to_string());
            find.push(format!("*/{}/*", dir));
        }

        let output = self.monitor.exec(container_id, &find).await?;
        let candidates: Vec<&str> = output
            .lines
            .iter()
            .map(|line| line.trim())
            .filter(|line| line.starts_with('/'))
            .collect();
        tracing::debug!(container = container_id, ?candidates, "Codebase anchor candidates");

        for candidate in candidates {
            let read = ["cat".to_string(), candidate.to_string()];
            let content = match self.monitor.exec(container_id, &read).await {
                Ok(output) if output.success() => output.text(),
                Ok(_) | Err(_) => continue,
            };
            if anchor_name(&content).as_deref() == Some(project_name) {
                let dir = match candidate.rsplit_once('/') {
                    Some(("", _)) => "/".to_string(),
                    Some((dir, _)) => dir.to_string(),
                    None => continue,
                };
                self.reporter
                    .info(1, format!("Found codebase {} at {}", project_name, dir));
                return Ok(dir);
            }
        }

        Err(Error::CodebaseNotFound {
            name: project_name.to_string(),
        })
    }

    /// Overlay the mounted repository onto the codebase directory
    pub async fn copy_repository(&self, container_id: &str, codebase: &str) -> Result<()> {
        let script = format!(
            "cp -rf {}/. {}",
            shell_escape(self.settings.repository_mount.trim_end_matches('/')),
            shell_escape(codebase)
        );
        let output = self
            .monitor
            .exec_shell(container_id, &script)
            .await
            .map_err(|e| Error::CodebaseCopy {
                target: codebase.to_string(),
                reason: e.to_string(),
            })?;
        if !output.success() {
            return Err(Error::CodebaseCopy {
                target: codebase.to_string(),
                reason: output.tail(5),
            });
        }
        tracing::info!(container = container_id, codebase, "Copied repository into codebase");
        Ok(())
    }
}

fn anchor_name(content: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    value.get("name")?.as_str().map(str::to_string)
}
