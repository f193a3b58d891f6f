//! Isolated WordPress environments for acceptance testing
//!
//! This crate provisions a private Docker network with a database, a WordPress
//! application server and a browser driver, injects a snapshot into it, and
//! tears everything down again once the test run is finished.

mod builder;
mod config;
mod containers;
pub mod docker;
mod environment;
mod images;
mod logs;
mod network;
mod ports;
mod readiness;
mod registry;
pub mod runtime;
mod snapshot;

pub use builder::{RunContext, RunContextBuilder};
pub use config::{DatabaseCredentials, EnvironmentSettings, SuiteConfig, SUITE_CONFIG_FILE};
pub use containers::{ContainerHandle, ContainerOrchestrator, ContainerState, ServiceRole};
pub use docker::DockerRuntime;
pub use environment::{Environment, TeardownError, TeardownReport, TeardownStep};
pub use images::{ImageProvisioner, APPLICATION_DOCKERFILE};
pub use logs::{LineBuffer, LogEntry, LogKind, LogSink, MemorySink, Reporter, TracingSink};
pub use network::NetworkManager;
pub use ports::{find_open_port, find_open_port_excluding};
pub use readiness::{Readiness, ReadinessMonitor};
pub use registry::{EnvironmentInfo, EnvironmentRegistry};
pub use runtime::{ContainerRuntime, ContainerSpec, ExecOutput, ImageRef, ResourceSummary};
pub use snapshot::{
    rewrite_url, InjectionTarget, SiteMapping, SnapshotInjector, SnapshotMeta, SnapshotStore,
    WpSnapshotsStore,
};

/// Result type used throughout this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while provisioning or tearing down an environment
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No open port in {host}:{start}-{end}")]
    NoPortAvailable { host: String, start: u16, end: u16 },

    #[error("Failed to create network {name}: {reason}")]
    NetworkCreate { name: String, reason: String },

    #[error("Failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Failed to build image {image}: {reason}")]
    ImageBuild { image: String, reason: String },

    #[error("Failed to create container {name}: {reason}")]
    ContainerCreate { name: String, reason: String },

    #[error("Failed to start container {name}: {reason}")]
    ContainerStart { name: String, reason: String },

    #[error("Container {name} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        name: String,
        from: ContainerState,
        to: ContainerState,
    },

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Snapshot pull failed: {0}")]
    SnapshotPull(String),

    #[error("No codebase named {name:?} found in snapshot")]
    CodebaseNotFound { name: String },

    #[error("Failed to copy codebase into {target}: {reason}")]
    CodebaseCopy { target: String, reason: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}
