use crate::{ports::find_open_port_excluding, Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

/// What other collaborators need to know about a provisioned environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentInfo {
    pub network_id: String,
    pub application_port: u16,
    pub browser_driver_port: u16,
    pub gateway_ip: Ipv4Addr,
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

#[derive(Debug, Default)]
struct RegistryState {
    environments: Vec<EnvironmentInfo>,
    /// port -> network id holding it
    reserved_ports: BTreeMap<u16, String>,
}

/// Environments of this process in creation order, plus the host ports
/// they hold.
///
/// Ports are picked and reserved under one lock, so two environments
/// created through the same registry never receive the same port.
#[derive(Debug, Default)]
pub struct EnvironmentRegistry {
    state: Mutex<RegistryState>,
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the application port from the bottom of `range` and the browser
    /// driver port above it, skipping every port already reserved, and
    /// reserve both for `network_id`.
    ///
    /// Probes the host with blocking connects while holding the lock; call it
    /// off the async workers.
    pub fn allocate_ports(
        &self,
        network_id: &str,
        host: &str,
        range: (u16, u16),
    ) -> Result<(u16, u16)> {
        let mut state = self.state.lock();
        let mut taken: BTreeSet<u16> = state.reserved_ports.keys().copied().collect();

        let application = find_open_port_excluding(host, range.0, range.1, &taken)?;
        if application >= range.1 {
            return Err(Error::NoPortAvailable {
                host: host.to_string(),
                start: range.0,
                end: range.1,
            });
        }
        taken.insert(application);
        let browser = find_open_port_excluding(host, application + 1, range.1, &taken)?;

        state
            .reserved_ports
            .insert(application, network_id.to_string());
        state.reserved_ports.insert(browser, network_id.to_string());
        tracing::debug!(network = network_id, application, browser, "Reserved ports");
        Ok((application, browser))
    }

    /// Release every port held by `network_id`
    pub fn release_ports(&self, network_id: &str) {
        self.state
            .lock()
            .reserved_ports
            .retain(|_, owner| owner != network_id);
    }

    pub fn reserved_ports(&self) -> BTreeSet<u16> {
        self.state.lock().reserved_ports.keys().copied().collect()
    }

    pub fn register(&self, info: EnvironmentInfo) {
        let mut state = self.state.lock();
        state.environments.retain(|e| e.network_id != info.network_id);
        state.environments.push(info);
    }

    /// Mark an environment destroyed and release its ports
    pub fn deactivate(&self, network_id: &str) {
        let mut state = self.state.lock();
        for env in state
            .environments
            .iter_mut()
            .filter(|e| e.network_id == network_id)
        {
            env.active = false;
        }
        state.reserved_ports.retain(|_, owner| owner != network_id);
    }

    /// Most recently created environment that is still alive
    pub fn current(&self) -> Option<EnvironmentInfo> {
        self.state
            .lock()
            .environments
            .iter()
            .rev()
            .find(|e| e.active)
            .cloned()
    }

    pub fn get(&self, network_id: &str) -> Option<EnvironmentInfo> {
        self.state
            .lock()
            .environments
            .iter()
            .find(|e| e.network_id == network_id)
            .cloned()
    }

    /// Live environments in creation order
    pub fn active(&self) -> Vec<EnvironmentInfo> {
        self.state
            .lock()
            .environments
            .iter()
            .filter(|e| e.active)
            .cloned()
            .collect()
    }

    /// Every environment ever registered, in creation order
    pub fn all(&self) -> Vec<EnvironmentInfo> {
        self.state.lock().environments.clone()
    }
}
