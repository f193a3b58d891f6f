use crate::{
    config::{EnvironmentSettings, SuiteConfig},
    docker::DockerRuntime,
    environment::Environment,
    logs::{LogSink, Reporter, TracingSink},
    network::resource_age,
    registry::EnvironmentRegistry,
    runtime::ContainerRuntime,
    snapshot::{SnapshotStore, WpSnapshotsStore},
    Result,
};
use std::sync::Arc;
use std::time::Duration;

/// Everything a test run shares: the container backend, the snapshot store,
/// settings, the user-facing log sink and the registry of environments.
///
/// Owned by whatever drives the run and handed to every environment it
/// creates; there is no global state.
pub struct RunContext {
    runtime: Arc<dyn ContainerRuntime>,
    snapshots: Arc<dyn SnapshotStore>,
    settings: EnvironmentSettings,
    registry: EnvironmentRegistry,
    reporter: Reporter,
}

impl RunContext {
    pub fn builder() -> RunContextBuilder {
        RunContextBuilder::new()
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }

    pub fn settings(&self) -> &EnvironmentSettings {
        &self.settings
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.registry
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Provision a new environment for `snapshot_id`
    pub async fn create_environment(
        self: &Arc<Self>,
        snapshot_id: &str,
        suite: Arc<SuiteConfig>,
    ) -> Result<Environment> {
        Environment::create(Arc::clone(self), snapshot_id, suite).await
    }

    /// Remove containers and networks left behind by earlier runs.
    ///
    /// Only resources whose name carries this context's prefix and whose
    /// embedded timestamp is older than `max_age` are touched. Pass
    /// `Duration::ZERO` to remove all of them. Failures are logged and skipped.
    pub async fn cleanup_stale(&self, max_age: Duration) -> Result<usize> {
        let prefix = &self.settings.name_prefix;
        let live: Vec<String> = self
            .registry
            .active()
            .into_iter()
            .map(|e| e.network_id)
            .collect();
        let is_stale = |name: &str| {
            if live.iter().any(|id| name.ends_with(id.as_str())) {
                return false;
            }
            match resource_age(name, prefix) {
                Some(age) => max_age.is_zero() || age > max_age,
                None => false,
            }
        };

        let mut removed = 0;

        match self.runtime.list_containers(prefix).await {
            Ok(containers) => {
                for container in containers.into_iter().filter(|c| is_stale(&c.name)) {
                    tracing::info!(container = %container.name, "Removing stale container");
                    if let Err(e) = self.runtime.stop_container(&container.id).await {
                        tracing::debug!(container = %container.name, error = %e, "Failed to stop stale container");
                    }
                    match self.runtime.remove_container(&container.id).await {
                        Ok(()) => removed += 1,
                        Err(e) => {
                            tracing::warn!(container = %container.name, error = %e, "Failed to remove stale container")
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Failed to list containers for cleanup: {}", e);
            }
        }

        // Networks go last; they can't be removed while containers are attached.
        match self.runtime.list_networks(prefix).await {
            Ok(networks) => {
                for network in networks.into_iter().filter(|n| is_stale(&n.name)) {
                    tracing::info!(network = %network.name, "Removing stale network");
                    match self.runtime.remove_network(&network.id).await {
                        Ok(()) => removed += 1,
                        Err(e) => {
                            tracing::warn!(network = %network.name, error = %e, "Failed to remove stale network")
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Failed to list networks for cleanup: {}", e);
            }
        }

        if removed > 0 {
            tracing::info!("Removed {} stale resource(s)", removed);
        }
        Ok(removed)
    }
}

/// Builder for a [`RunContext`]
pub struct RunContextBuilder {
    settings: Option<EnvironmentSettings>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    sink: Arc<dyn LogSink>,
    verbosity: u8,
}

impl Default for RunContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContextBuilder {
    pub fn new() -> Self {
        Self {
            settings: None,
            runtime: None,
            snapshots: None,
            sink: Arc::new(TracingSink),
            verbosity: 1,
        }
    }

    /// Use these settings instead of [`EnvironmentSettings::from_env`]
    pub fn settings(mut self, settings: EnvironmentSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Use this container backend instead of connecting to Docker
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Use this snapshot store instead of the host's wpsnapshots cache
    pub fn snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Where user-facing progress messages go
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Highest verbosity (0-3) passed to the log sink
    pub fn verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity.min(3);
        self
    }

    pub async fn build(self) -> Result<Arc<RunContext>> {
        let settings = match self.settings {
            Some(settings) => settings,
            None => EnvironmentSettings::from_env()?,
        };

        let runtime: Arc<dyn ContainerRuntime> = match self.runtime {
            Some(runtime) => runtime,
            None => Arc::new(
                DockerRuntime::connect()
                    .await?
                    .with_stop_timeout(settings.stop_timeout),
            ),
        };

        let snapshots: Arc<dyn SnapshotStore> = match self.snapshots {
            Some(snapshots) => snapshots,
            None => Arc::new(WpSnapshotsStore::new(&settings.snapshots_dir)),
        };

        Ok(Arc::new(RunContext {
            runtime,
            snapshots,
            settings,
            registry: EnvironmentRegistry::new(),
            reporter: Reporter::new(self.sink, self.verbosity),
        }))
    }
}
