//! Container backend abstraction
//!
//! Everything the lifecycle needs from a container engine goes through
//! [`ContainerRuntime`]. [`crate::DockerRuntime`] talks to a Docker daemon;
//! tests plug in an in-memory implementation.

use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::net::Ipv4Addr;

/// An image reference split into repository name and tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// Parse `name[:tag]`, defaulting the tag to `latest`.
    ///
    /// A colon inside a registry host (`localhost:5000/foo`) is not a tag.
    pub fn parse(reference: &str) -> Self {
        match reference.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => Self::new(name, tag),
            _ => Self::new(reference, "latest"),
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// Everything needed to create one service container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    /// Network the container is attached to at creation time
    pub network: String,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    /// `(container_port, host_port)` TCP bindings
    pub port_bindings: Vec<(u16, u16)>,
    /// `(host_path, container_path)` bind mounts
    pub binds: Vec<(String, String)>,
    /// `(hostname, ip)` entries added to the container's hosts file
    pub extra_hosts: Vec<(String, String)>,
    pub shm_size: Option<i64>,
}

/// Combined stdout/stderr of a finished exec, split into lines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub lines: Vec<String>,
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Last `n` lines, for error messages
    pub fn tail(&self, n: usize) -> String {
        let start = self.lines.len().saturating_sub(n);
        self.lines[start..].join("\n")
    }
}

/// A container or network found by name prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSummary {
    pub id: String,
    pub name: String,
}

/// Operations the environment lifecycle consumes from a container engine.
///
/// Containers and networks are addressed by name or id interchangeably.
/// Stopping a stopped container and removing something that no longer exists
/// must succeed, so teardown can be repeated.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a bridge network and return its id
    async fn create_network(&self, name: &str) -> Result<String>;

    /// Gateway address assigned to a network, if the engine reports one
    async fn network_gateway(&self, name: &str) -> Result<Option<Ipv4Addr>>;

    async fn remove_network(&self, name: &str) -> Result<()>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull an image; the stream yields progress lines and ends when the pull is done
    fn pull_image(&self, image: &ImageRef) -> BoxStream<'_, Result<String>>;

    /// Build `tag` from a tar archive of the build context
    fn build_image(&self, tag: &str, context: Vec<u8>) -> BoxStream<'_, Result<String>>;

    /// Create a container and return its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str) -> Result<()>;

    async fn is_running(&self, id: &str) -> Result<bool>;

    /// Everything the container has written to stdout/stderr so far
    async fn container_logs(&self, id: &str) -> Result<Vec<String>>;

    /// Run a command inside a running container and wait for it to exit
    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput>;

    async fn list_containers(&self, prefix: &str) -> Result<Vec<ResourceSummary>>;

    async fn list_networks(&self, prefix: &str) -> Result<Vec<ResourceSummary>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ref_parsing() {
        assert_eq!(ImageRef::parse("mysql:5.7"), ImageRef::new("mysql", "5.7"));
        assert_eq!(ImageRef::parse("mysql"), ImageRef::new("mysql", "latest"));
        assert_eq!(
            ImageRef::parse("localhost:5000/wp"),
            ImageRef::new("localhost:5000/wp", "latest")
        );
        assert_eq!(
            ImageRef::parse("localhost:5000/wp:6.4").to_string(),
            "localhost:5000/wp:6.4"
        );
    }

    #[test]
    fn exec_output_tail() {
        let output = ExecOutput {
            lines: vec!["a".into(), "b".into(), "c".into()],
            exit_code: Some(1),
        };
        assert!(!output.success());
        assert_eq!(output.tail(2), "b\nc");
        assert_eq!(output.tail(10), "a\nb\nc");
    }
}
