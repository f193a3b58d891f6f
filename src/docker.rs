//! Docker implementation of [`ContainerRuntime`] on top of bollard.

use crate::{
    logs::LineBuffer,
    runtime::{ContainerRuntime, ContainerSpec, ExecOutput, ImageRef, ResourceSummary},
    Error, Result,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    errors::Error as DockerError,
    exec::{CreateExecOptions, StartExecResults},
    image::{BuildImageOptions, CreateImageOptions},
    network::{CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions},
    secret::{ContainerStateStatusEnum, HostConfig, PortBinding},
    Docker,
};
use futures::{stream::BoxStream, StreamExt};
use std::{collections::HashMap, net::Ipv4Addr, time::Duration};

/// Talks to the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    stop_timeout: Duration,
}

impl DockerRuntime {
    /// Connect with the local defaults (`DOCKER_HOST` or the default socket)
    /// and make sure the daemon answers.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Other(anyhow::anyhow!("Failed to connect to Docker: {}", e)))?;

        docker
            .ping()
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("Docker ping failed: {}", e)))?;

        Ok(Self::from_client(docker))
    }

    pub fn from_client(docker: Docker) -> Self {
        Self {
            docker,
            stop_timeout: Duration::from_secs(5),
        }
    }

    /// Grace period before a stopping container is killed
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }
}

/// Docker answers 304 for "already stopped" and 404 for "no such object".
fn is_status(err: &DockerError, codes: &[u16]) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError { status_code, .. } if codes.contains(status_code)
    )
}

fn docker_err(context: &str, e: DockerError) -> Error {
    Error::Other(anyhow::anyhow!("{}: {}", context, e))
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let exposed_ports = spec
        .port_bindings
        .iter()
        .map(|(container_port, _)| (format!("{}/tcp", container_port), HashMap::new()))
        .collect::<HashMap<_, _>>();

    let port_bindings = spec
        .port_bindings
        .iter()
        .map(|(container_port, host_port)| {
            (
                format!("{}/tcp", container_port),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            )
        })
        .collect::<HashMap<_, _>>();

    let binds = spec
        .binds
        .iter()
        .map(|(host, container)| format!("{}:{}", host, container))
        .collect::<Vec<_>>();

    let extra_hosts = spec
        .extra_hosts
        .iter()
        .map(|(host, ip)| format!("{}:{}", host, ip))
        .collect::<Vec<_>>();

    Config {
        image: Some(spec.image.clone()),
        hostname: spec.hostname.clone(),
        env: (!spec.env.is_empty()).then(|| spec.env.clone()),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(HostConfig {
            network_mode: Some(spec.network.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            binds: (!binds.is_empty()).then_some(binds),
            extra_hosts: (!extra_hosts.is_empty()).then_some(extra_hosts),
            shm_size: spec.shm_size,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_network(&self, name: &str) -> Result<String> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            check_duplicate: true,
            ..Default::default()
        };

        let response = self
            .docker
            .create_network(options)
            .await
            .map_err(|e| docker_err("Failed to create network", e))?;
        response.id.ok_or_else(|| Error::NetworkCreate {
            name: name.to_string(),
            reason: "engine returned no network id".to_string(),
        })
    }

    async fn network_gateway(&self, name: &str) -> Result<Option<Ipv4Addr>> {
        let network = self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
            .map_err(|e| docker_err("Failed to inspect network", e))?;

        let gateway = network
            .ipam
            .and_then(|ipam| ipam.config)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|config| config.gateway)
            .find_map(|gateway| gateway.parse::<Ipv4Addr>().ok());
        Ok(gateway)
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        match self.docker.remove_network(name).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, &[404]) => {
                tracing::debug!(network = name, "Network already gone");
                Ok(())
            }
            Err(e) => Err(docker_err("Failed to remove network", e)),
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, &[404]) => Ok(false),
            Err(e) => Err(docker_err("Failed to inspect image", e)),
        }
    }

    fn pull_image(&self, image: &ImageRef) -> BoxStream<'_, Result<String>> {
        let options = CreateImageOptions {
            from_image: image.name.clone(),
            tag: image.tag.clone(),
            ..Default::default()
        };

        self.docker
            .create_image(Some(options), None, None)
            .map(|result| match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(Error::Other(anyhow::anyhow!("{}", error)));
                    }
                    let mut line = info.status.unwrap_or_default();
                    if let Some(progress) = info.progress {
                        line.push(' ');
                        line.push_str(&progress);
                    }
                    Ok(line)
                }
                Err(e) => Err(docker_err("Image pull failed", e)),
            })
            .boxed()
    }

    fn build_image(&self, tag: &str, context: Vec<u8>) -> BoxStream<'_, Result<String>> {
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };

        self.docker
            .build_image(options, None, Some(context.into()))
            .flat_map(|result| {
                let lines: Vec<Result<String>> = match result {
                    Ok(info) => match (info.error, info.stream) {
                        (Some(error), _) => {
                            vec![Err(Error::Other(anyhow::anyhow!("{}", error)))]
                        }
                        (None, Some(stream)) => LineBuffer::split(stream.as_bytes())
                            .into_iter()
                            .map(Ok)
                            .collect(),
                        (None, None) => Vec::new(),
                    },
                    Err(e) => vec![Err(docker_err("Image build failed", e))],
                };
                futures::stream::iter(lines)
            })
            .boxed()
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                container_config(spec),
            )
            .await
            .map_err(|e| docker_err("Failed to create container", e))?;

        for warning in response.warnings {
            tracing::warn!(container = %spec.name, "{}", warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| docker_err("Failed to start container", e))
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let options = StopContainerOptions {
            t: self.stop_timeout.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, &[304, 404]) => Ok(()),
            Err(e) => Err(docker_err("Failed to stop container", e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, &[404]) => Ok(()),
            Err(e) => Err(docker_err("Failed to remove container", e)),
        }
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        let info = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| docker_err("Failed to inspect container", e))?;
        Ok(info
            .state
            .and_then(|s| s.status)
            .map(|s| s == ContainerStateStatusEnum::RUNNING)
            .unwrap_or(false))
    }

    async fn container_logs(&self, id: &str) -> Result<Vec<String>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));
        let mut buffer = LineBuffer::new();
        let mut lines = Vec::new();

        while let Some(log_result) = logs.next().await {
            match log_result {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    lines.extend(buffer.push(&message));
                }
                Ok(_) => {}
                Err(e) => return Err(docker_err("Failed to read container logs", e)),
            }
        }
        lines.extend(buffer.finish());
        Ok(lines)
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| docker_err("Failed to create exec", e))?;

        let output = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| docker_err("Failed to start exec", e))?;

        let mut buffer = LineBuffer::new();
        let mut lines = Vec::new();
        if let StartExecResults::Attached { mut output, .. } = output {
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                        lines.extend(buffer.push(&message));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(docker_err("Exec stream failed", e)),
                }
            }
        }
        lines.extend(buffer.finish());

        let exit_code = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| docker_err("Failed to inspect exec", e))?
            .exit_code;

        Ok(ExecOutput { lines, exit_code })
    }

    async fn list_containers(&self, prefix: &str) -> Result<Vec<ResourceSummary>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| docker_err("Failed to list containers", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|container| {
                let id = container.id?;
                let name = container
                    .names
                    .and_then(|n| n.first().cloned())?
                    .trim_start_matches('/')
                    .to_string();
                Some(ResourceSummary { id, name })
            })
            .collect())
    }

    async fn list_networks(&self, prefix: &str) -> Result<Vec<ResourceSummary>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);

        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
            .map_err(|e| docker_err("Failed to list networks", e))?;

        Ok(networks
            .into_iter()
            .filter_map(|network| {
                Some(ResourceSummary {
                    id: network.id?,
                    name: network.name?,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_config_from_spec() {
        let spec = ContainerSpec {
            name: "wordpress-wpassure-1".into(),
            image: "wpassure/wordpress:latest".into(),
            network: "wpassure-1".into(),
            env: vec!["A=b".into()],
            port_bindings: vec![(80, 1000)],
            binds: vec![("/home/me/plugin".into(), "/root/repo".into())],
            extra_hosts: vec![("wpassure.test".into(), "172.18.0.1".into())],
            ..Default::default()
        };

        let config = container_config(&spec);
        let host_config = config.host_config.unwrap();
        assert_eq!(host_config.network_mode.as_deref(), Some("wpassure-1"));
        assert_eq!(
            host_config.binds,
            Some(vec!["/home/me/plugin:/root/repo".to_string()])
        );
        assert_eq!(
            host_config.extra_hosts,
            Some(vec!["wpassure.test:172.18.0.1".to_string()])
        );
        let binding = host_config.port_bindings.unwrap()["80/tcp"].clone().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("1000"));
        assert!(config.exposed_ports.unwrap().contains_key("80/tcp"));
    }

    #[test]
    fn empty_lists_are_omitted() {
        let config = container_config(&ContainerSpec {
            name: "mysql-x".into(),
            image: "mysql:5.7".into(),
            network: "x".into(),
            ..Default::default()
        });
        assert!(config.env.is_none());
        assert!(config.exposed_ports.is_none());
        assert!(config.host_config.unwrap().port_bindings.is_none());
    }
}
