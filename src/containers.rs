use crate::{
    runtime::{ContainerRuntime, ContainerSpec},
    Error, Result,
};
use std::sync::Arc;

/// The three services every environment runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceRole {
    Database,
    Application,
    BrowserDriver,
}

impl ServiceRole {
    /// Creation and start order
    pub const ALL: [ServiceRole; 3] = [
        ServiceRole::Database,
        ServiceRole::Application,
        ServiceRole::BrowserDriver,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "mysql",
            Self::Application => "wordpress",
            Self::BrowserDriver => "selenium",
        }
    }

    /// Container name: `<role>-<network id>`
    pub fn container_name(&self, network_id: &str) -> String {
        format!("{}-{}", self.as_str(), network_id)
    }
}

impl std::fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Unconfigured,
    Created,
    Running,
    Stopped,
    Removed,
}

impl ContainerState {
    fn can_become(self, next: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, next),
            (Unconfigured, Created)
                | (Created, Running)
                | (Created, Removed)
                | (Running, Stopped)
                | (Stopped, Removed)
        )
    }
}

/// A container owned by one environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub role: ServiceRole,
    pub name: String,
    pub id: String,
    state: ContainerState,
}

impl ContainerHandle {
    pub fn state(&self) -> ContainerState {
        self.state
    }

    fn transition(&mut self, next: ContainerState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(Error::InvalidTransition {
                name: self.name.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Creates, starts, stops and removes the service containers of one environment.
///
/// Handles are kept in creation order; start follows that order, so the
/// database is always started first.
pub struct ContainerOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    handles: Vec<ContainerHandle>,
}

impl ContainerOrchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            handles: Vec::new(),
        }
    }

    pub fn handles(&self) -> &[ContainerHandle] {
        &self.handles
    }

    pub fn handle(&self, role: ServiceRole) -> Option<&ContainerHandle> {
        self.handles.iter().find(|h| h.role == role)
    }

    /// Submit creation requests in order. Stops at the first rejection;
    /// whatever was created before it stays tracked for teardown.
    pub async fn create(&mut self, specs: Vec<(ServiceRole, ContainerSpec)>) -> Result<()> {
        for (role, spec) in specs {
            if self.handle(role).is_some() {
                return Err(Error::ContainerCreate {
                    name: spec.name,
                    reason: format!("a {} container already exists", role),
                });
            }

            let id = self
                .runtime
                .create_container(&spec)
                .await
                .map_err(|e| Error::ContainerCreate {
                    name: spec.name.clone(),
                    reason: e.to_string(),
                })?;

            let mut handle = ContainerHandle {
                role,
                name: spec.name.clone(),
                id,
                state: ContainerState::Unconfigured,
            };
            handle.transition(ContainerState::Created)?;
            tracing::info!(container = %handle.name, id = %handle.id, image = %spec.image, "Created container");
            self.handles.push(handle);
        }
        Ok(())
    }

    /// Start every created container in creation order.
    ///
    /// Returns once the engine acknowledged each start; the services inside
    /// may still be initialising.
    pub async fn start(&mut self) -> Result<()> {
        for handle in &mut self.handles {
            if handle.state == ContainerState::Running {
                continue;
            }
            if !handle.state.can_become(ContainerState::Running) {
                return Err(Error::InvalidTransition {
                    name: handle.name.clone(),
                    from: handle.state,
                    to: ContainerState::Running,
                });
            }
            self.runtime
                .start_container(&handle.id)
                .await
                .map_err(|e| Error::ContainerStart {
                    name: handle.name.clone(),
                    reason: e.to_string(),
                })?;
            handle.transition(ContainerState::Running)?;
            tracing::info!(container = %handle.name, "Started container");
        }
        Ok(())
    }

    /// Confirm that every container is tracked as running and that the
    /// engine agrees.
    pub async fn verify_running(&self) -> Result<()> {
        for handle in &self.handles {
            let running = handle.state == ContainerState::Running
                && self.runtime.is_running(&handle.id).await.unwrap_or(false);
            if !running {
                return Err(Error::ContainerStart {
                    name: handle.name.clone(),
                    reason: "container is not running".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Stop every running container. Failures are collected, not raised,
    /// and never keep the remaining containers from being stopped.
    pub async fn stop_all(&mut self) -> Vec<(String, Error)> {
        let mut failures = Vec::new();
        for handle in &mut self.handles {
            if handle.state != ContainerState::Running {
                continue;
            }
            match self.runtime.stop_container(&handle.id).await {
                Ok(()) => {
                    handle.state = ContainerState::Stopped;
                    tracing::info!(container = %handle.name, "Stopped container");
                }
                Err(e) => {
                    tracing::error!(container = %handle.name, error = %e, "Failed to stop container");
                    failures.push((handle.name.clone(), e));
                }
            }
        }
        failures
    }

    /// Remove every container not yet removed, same failure policy as
    /// [`Self::stop_all`]. Removed handles are dropped from tracking.
    pub async fn remove_all(&mut self) -> Vec<(String, Error)> {
        let mut failures = Vec::new();
        for handle in &mut self.handles {
            if handle.state == ContainerState::Removed {
                continue;
            }
            // A container whose stop failed still gets a forced removal.
            match self.runtime.remove_container(&handle.id).await {
                Ok(()) => {
                    handle.state = ContainerState::Removed;
                    tracing::info!(container = %handle.name, "Removed container");
                }
                Err(e) => {
                    tracing::error!(container = %handle.name, error = %e, "Failed to remove container");
                    failures.push((handle.name.clone(), e));
                }
            }
        }
        self.handles.retain(|h| h.state != ContainerState::Removed);
        failures
    }
}
