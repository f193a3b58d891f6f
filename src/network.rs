use crate::{runtime::ContainerRuntime, Error, Result};
use rand::Rng;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

const NETWORK_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Creates and removes the isolated bridge network of one environment
#[derive(Clone)]
pub struct NetworkManager {
    runtime: Arc<dyn ContainerRuntime>,
}

impl NetworkManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Create the network and return the gateway address containers use to
    /// reach the host.
    pub async fn create_network(&self, id: &str) -> Result<Ipv4Addr> {
        let network_id = self
            .runtime
            .create_network(id)
            .await
            .map_err(|e| Error::NetworkCreate {
                name: id.to_string(),
                reason: e.to_string(),
            })?;

        let gateway = self
            .runtime
            .network_gateway(id)
            .await
            .map_err(|e| Error::NetworkCreate {
                name: id.to_string(),
                reason: format!("inspect failed: {}", e),
            })?
            .ok_or_else(|| Error::NetworkCreate {
                name: id.to_string(),
                reason: "no gateway address assigned".to_string(),
            })?;

        tracing::info!(network = id, %network_id, %gateway, "Created network");
        Ok(gateway)
    }

    /// Remove the network. Failures are returned for the teardown report but
    /// never abort the caller.
    pub async fn delete_network(&self, id: &str) -> Result<()> {
        match self.runtime.remove_network(id).await {
            Ok(()) => {
                tracing::info!(network = id, "Removed network");
                Ok(())
            }
            Err(e) => {
                tracing::error!(network = id, error = %e, "Failed to remove network");
                Err(e)
            }
        }
    }
}

/// Generate a network identifier: `<prefix>-YYYYMMDD-HHMMSS-<random>`.
///
/// The timestamp lets stale networks from crashed runs be recognised by age.
pub(crate) fn generate_network_id(prefix: &str) -> String {
    let timestamp = chrono::Utc::now().format(NETWORK_TIMESTAMP_FORMAT);
    let random_id = rand::thread_rng().gen::<u16>();
    format!("{}-{}-{}", prefix, timestamp, random_id)
}

/// Age of a resource whose name embeds a network id with `prefix`.
///
/// Container names look like `<role>-<network id>`, so the prefix is searched
/// anywhere in the name.
pub(crate) fn resource_age(name: &str, prefix: &str) -> Option<Duration> {
    let name = name.trim_start_matches('/');
    let marker = format!("{}-", prefix);
    let idx = name.find(&marker)?;
    let rest = &name[idx + marker.len()..];

    let parts: Vec<&str> = rest.split('-').collect();
    if parts.len() < 2 {
        return None;
    }
    let date_time = format!("{}-{}", parts[0], parts[1]);
    let created = chrono::NaiveDateTime::parse_from_str(&date_time, NETWORK_TIMESTAMP_FORMAT)
        .ok()?
        .and_utc();
    let age = chrono::Utc::now().signed_duration_since(created);
    Some(age.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix_and_timestamp() {
        let id = generate_network_id("wpassure");
        assert!(id.starts_with("wpassure-"));
        let age = resource_age(&id, "wpassure").expect("timestamp should parse");
        assert!(age < Duration::from_secs(60));
    }

    #[test]
    fn age_of_container_names() {
        let age = resource_age("/mysql-wpassure-20200101-120000-42", "wpassure").unwrap();
        assert!(age > Duration::from_secs(86_400));

        assert_eq!(resource_age("mysql-other-20200101-120000-42", "wpassure"), None);
        assert_eq!(resource_age("wpassure-garbage", "wpassure"), None);
    }
}
