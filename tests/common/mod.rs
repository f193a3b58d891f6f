//! In-memory container backend and snapshot store for lifecycle tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use wpassure::{
    ContainerRuntime, ContainerSpec, EnvironmentSettings, Error, ExecOutput, ImageRef,
    MemorySink, ResourceSummary, Result, RunContext, SiteMapping, SnapshotMeta, SnapshotStore,
    SuiteConfig,
};

pub const SUITE_NAME: &str = "my-plugin";
pub const SNAPSHOT_ID: &str = "0123456789abcdef0123456789abcdef";
pub const CODEBASE_DIR: &str = "/var/www/html/wp-content/plugins/my-plugin";

/// Backend operations failures can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    CreateNetwork,
    RemoveNetwork,
    PullImage,
    BuildImage,
    CreateContainer,
    StartContainer,
    StopContainer,
    RemoveContainer,
}

/// One call the lifecycle made against the backend, by resource name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateNetwork(String),
    RemoveNetwork(String),
    PullImage(String),
    BuildImage(String),
    CreateContainer(String),
    StartContainer(String),
    StopContainer(String),
    RemoveContainer(String),
    Logs(String),
    Exec(String, Vec<String>),
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub running: bool,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    networks: BTreeMap<String, Ipv4Addr>,
    images: BTreeSet<String>,
    containers: BTreeMap<String, FakeContainer>,
    next_id: u64,
    failures: Vec<(Op, String)>,
    exec_failures: Vec<String>,
    logs: BTreeMap<String, Vec<String>>,
    files: BTreeMap<String, String>,
}

/// Records every call and keeps just enough state to answer like Docker would
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    /// A backend whose database prints its ready line and whose application
    /// container holds one codebase named [`SUITE_NAME`]
    pub fn new() -> Arc<Self> {
        let runtime = Self {
            state: Mutex::new(FakeState::default()),
        };
        runtime.set_logs(
            "mysql-",
            &[
                "[Note] mysqld: ready for connections.",
                "Version: '5.7.44'  socket: '/var/run/mysqld/mysqld.sock'  port: 3306  MySQL Community Server (GPL)",
            ],
        );
        runtime.add_file(
            &format!("{}/wpassure.json", CODEBASE_DIR),
            &format!(r#"{{"name": "{}"}}"#, SUITE_NAME),
        );
        Arc::new(runtime)
    }

    /// Fail every `op` on a resource whose name contains `needle`
    pub fn fail_on(&self, op: Op, needle: &str) {
        self.state.lock().failures.push((op, needle.to_string()));
    }

    /// Make every exec whose joined command line contains `needle` exit non-zero
    pub fn fail_exec(&self, needle: &str) {
        self.state.lock().exec_failures.push(needle.to_string());
    }

    /// Output of containers whose name starts with `name_prefix`
    pub fn set_logs(&self, name_prefix: &str, lines: &[&str]) {
        self.state.lock().logs.insert(
            name_prefix.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
    }

    /// A file visible to `find` and `cat` inside every container
    pub fn add_file(&self, path: &str, content: &str) {
        self.state
            .lock()
            .files
            .insert(path.to_string(), content.to_string());
    }

    pub fn clear_files(&self) {
        self.state.lock().files.clear();
    }

    pub fn add_image(&self, image: &str) {
        self.state.lock().images.insert(image.to_string());
    }

    /// Pretend a network and container survived from an earlier run
    pub fn add_leftover(&self, network: &str, container: &str) {
        let mut state = self.state.lock();
        state
            .networks
            .insert(network.to_string(), Ipv4Addr::new(172, 30, 0, 1));
        state.next_id += 1;
        let id = format!("leftover-{}", state.next_id);
        state.containers.insert(
            id,
            FakeContainer {
                spec: ContainerSpec {
                    name: container.to_string(),
                    network: network.to_string(),
                    ..Default::default()
                },
                running: true,
            },
        );
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn networks(&self) -> Vec<String> {
        self.state.lock().networks.keys().cloned().collect()
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state.lock().containers.values().cloned().collect()
    }

    pub fn container_named(&self, prefix: &str) -> Option<FakeContainer> {
        self.state
            .lock()
            .containers
            .values()
            .find(|c| c.spec.name.starts_with(prefix))
            .cloned()
    }

    /// Every exec'd command line, joined with spaces
    pub fn exec_lines(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Exec(_, cmd) => Some(cmd.join(" ")),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| matches(c)).count()
    }

    fn check(&self, state: &FakeState, op: Op, name: &str) -> Result<()> {
        match state
            .failures
            .iter()
            .find(|(o, needle)| *o == op && name.contains(needle.as_str()))
        {
            Some(_) => Err(Error::Other(anyhow::anyhow!(
                "injected {:?} failure for {}",
                op,
                name
            ))),
            None => Ok(()),
        }
    }

    fn name_of(state: &FakeState, id: &str) -> String {
        state
            .containers
            .get(id)
            .map(|c| c.spec.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn run(state: &FakeState, cmd: &[String]) -> ExecOutput {
        let line = cmd.join(" ");
        if state.exec_failures.iter().any(|n| line.contains(n.as_str())) {
            return ExecOutput {
                lines: vec![format!("Error: injected failure for {}", line)],
                exit_code: Some(1),
            };
        }

        let ok = |lines: Vec<String>| ExecOutput {
            lines,
            exit_code: Some(0),
        };
        match cmd.first().map(String::as_str) {
            Some("find") => {
                let marker = cmd.get(5).cloned().unwrap_or_default();
                let excluded: Vec<String> = cmd
                    .windows(2)
                    .filter(|w| w[0] == "-path")
                    .map(|w| w[1].trim_matches('*').to_string())
                    .collect();
                ok(state
                    .files
                    .keys()
                    .filter(|path| path.rsplit('/').next() == Some(marker.as_str()))
                    .filter(|path| !excluded.iter().any(|dir| path.contains(dir.as_str())))
                    .cloned()
                    .collect())
            }
            Some("cat") => match cmd.get(1).and_then(|p| state.files.get(p)) {
                Some(content) => ok(content.lines().map(str::to_string).collect()),
                None => ExecOutput {
                    lines: vec!["No such file or directory".to_string()],
                    exit_code: Some(1),
                },
            },
            _ => ok(Vec::new()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_network(&self, name: &str) -> Result<String> {
        let mut state = self.state.lock();
        state.calls.push(Call::CreateNetwork(name.to_string()));
        self.check(&state, Op::CreateNetwork, name)?;
        if state.networks.contains_key(name) {
            return Err(Error::Other(anyhow::anyhow!("network {} exists", name)));
        }
        let octet = 18 + state.networks.len() as u8;
        state
            .networks
            .insert(name.to_string(), Ipv4Addr::new(172, octet, 0, 1));
        Ok(format!("net-{}", name))
    }

    async fn network_gateway(&self, name: &str) -> Result<Option<Ipv4Addr>> {
        Ok(self.state.lock().networks.get(name).copied())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::RemoveNetwork(name.to_string()));
        self.check(&state, Op::RemoveNetwork, name)?;
        if state.containers.values().any(|c| c.spec.network == name) {
            return Err(Error::Other(anyhow::anyhow!(
                "network {} has active endpoints",
                name
            )));
        }
        state.networks.remove(name);
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.state.lock().images.contains(image))
    }

    fn pull_image(&self, image: &ImageRef) -> BoxStream<'_, Result<String>> {
        let reference = image.to_string();
        let mut state = self.state.lock();
        state.calls.push(Call::PullImage(reference.clone()));
        let lines = match self.check(&state, Op::PullImage, &reference) {
            Ok(()) => {
                state.images.insert(reference.clone());
                vec![
                    Ok(format!("Pulling from {}", image.name)),
                    Ok(format!("Status: Downloaded newer image for {}", reference)),
                ]
            }
            Err(e) => vec![Ok("Pulling fs layer".to_string()), Err(e)],
        };
        stream::iter(lines).boxed()
    }

    fn build_image(&self, tag: &str, context: Vec<u8>) -> BoxStream<'_, Result<String>> {
        let mut state = self.state.lock();
        state.calls.push(Call::BuildImage(tag.to_string()));
        let lines = match self.check(&state, Op::BuildImage, tag) {
            Ok(()) if context.is_empty() => vec![Err(Error::Other(anyhow::anyhow!(
                "empty build context"
            )))],
            Ok(()) => {
                state.images.insert(tag.to_string());
                vec![
                    Ok("Step 1/2 : FROM wordpress:php7.4-apache".to_string()),
                    Ok(format!("Successfully tagged {}", tag)),
                ]
            }
            Err(e) => vec![Err(e)],
        };
        stream::iter(lines).boxed()
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock();
        state.calls.push(Call::CreateContainer(spec.name.clone()));
        self.check(&state, Op::CreateContainer, &spec.name)?;
        if !state.networks.contains_key(&spec.network) {
            return Err(Error::Other(anyhow::anyhow!(
                "network {} not found",
                spec.network
            )));
        }
        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(Error::Other(anyhow::anyhow!(
                "container name {} in use",
                spec.name
            )));
        }
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let name = Self::name_of(&state, id);
        state.calls.push(Call::StartContainer(name.clone()));
        self.check(&state, Op::StartContainer, &name)?;
        match state.containers.get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(Error::Other(anyhow::anyhow!("no such container {}", id))),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let name = Self::name_of(&state, id);
        state.calls.push(Call::StopContainer(name.clone()));
        self.check(&state, Op::StopContainer, &name)?;
        if let Some(container) = state.containers.get_mut(id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let name = Self::name_of(&state, id);
        state.calls.push(Call::RemoveContainer(name.clone()));
        self.check(&state, Op::RemoveContainer, &name)?;
        state.containers.remove(id);
        Ok(())
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .containers
            .get(id)
            .map(|c| c.running)
            .unwrap_or(false))
    }

    async fn container_logs(&self, id: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        let name = Self::name_of(&state, id);
        state.calls.push(Call::Logs(name.clone()));
        Ok(state
            .logs
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix.as_str()))
            .map(|(_, lines)| lines.clone())
            .unwrap_or_default())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let mut state = self.state.lock();
        let name = Self::name_of(&state, id);
        state.calls.push(Call::Exec(name, cmd.to_vec()));
        if !state.containers.get(id).map(|c| c.running).unwrap_or(false) {
            return Err(Error::Other(anyhow::anyhow!(
                "container {} is not running",
                id
            )));
        }
        Ok(Self::run(&state, cmd))
    }

    async fn list_containers(&self, prefix: &str) -> Result<Vec<ResourceSummary>> {
        Ok(self
            .state
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| c.spec.name.contains(prefix))
            .map(|(id, c)| ResourceSummary {
                id: id.clone(),
                name: c.spec.name.clone(),
            })
            .collect())
    }

    async fn list_networks(&self, prefix: &str) -> Result<Vec<ResourceSummary>> {
        Ok(self
            .state
            .lock()
            .networks
            .keys()
            .filter(|name| name.contains(prefix))
            .map(|name| ResourceSummary {
                id: name.clone(),
                name: name.clone(),
            })
            .collect())
    }
}

/// Snapshot store serving a fixed set of snapshots
#[derive(Default)]
pub struct FakeSnapshots {
    snapshots: Mutex<BTreeMap<String, SnapshotMeta>>,
}

impl FakeSnapshots {
    pub fn with_default() -> Arc<Self> {
        let store = Self::default();
        store.insert(SnapshotMeta {
            id: SNAPSHOT_ID.to_string(),
            project: Some(SUITE_NAME.to_string()),
            multisite: false,
            sites: vec![SiteMapping {
                home_url: "http://old.example.com/site".to_string(),
                site_url: "http://old.example.com/site/wp".to_string(),
                blog_id: None,
            }],
        });
        Arc::new(store)
    }

    pub fn insert(&self, meta: SnapshotMeta) {
        self.snapshots.lock().insert(meta.id.clone(), meta);
    }
}

#[async_trait]
impl SnapshotStore for FakeSnapshots {
    async fn create(&self, path: &Path) -> Result<String> {
        let id = format!("{:032x}", self.snapshots.lock().len() + 1);
        self.insert(SnapshotMeta {
            id: id.clone(),
            project: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            multisite: false,
            sites: Vec::new(),
        });
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<SnapshotMeta> {
        self.snapshots
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SnapshotNotFound(id.to_string()))
    }

    async fn push(&self, id: &str) -> Result<bool> {
        Ok(self.snapshots.lock().contains_key(id))
    }

    async fn is_cached(&self, id: &str) -> bool {
        self.snapshots.lock().contains_key(id)
    }
}

/// A port range nobody on this host is likely listening in
pub fn free_port_range() -> (u16, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    let start = port.min(u16::MAX - 100);
    (start, start + 100)
}

/// Settings that poll instantly and search a free port range
pub fn test_settings() -> EnvironmentSettings {
    EnvironmentSettings {
        port_range: free_port_range(),
        readiness_interval: Duration::ZERO,
        readiness_attempts: 3,
        snapshots_dir: std::env::temp_dir().join("wpassure-test-snapshots"),
        ..EnvironmentSettings::default()
    }
}

pub fn suite() -> Arc<SuiteConfig> {
    let mut suite = SuiteConfig::new(SUITE_NAME);
    suite.path = Some(std::env::temp_dir().join("wpassure-test-repo"));
    Arc::new(suite)
}

pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub snapshots: Arc<FakeSnapshots>,
    pub sink: Arc<MemorySink>,
    pub context: Arc<RunContext>,
}

pub async fn harness() -> Harness {
    harness_with(FakeRuntime::new(), test_settings()).await
}

pub async fn harness_with(runtime: Arc<FakeRuntime>, settings: EnvironmentSettings) -> Harness {
    let snapshots = FakeSnapshots::with_default();
    let sink = Arc::new(MemorySink::default());
    let context = RunContext::builder()
        .runtime(runtime.clone())
        .snapshots(snapshots.clone())
        .settings(settings)
        .log_sink(sink.clone())
        .verbosity(3)
        .build()
        .await
        .expect("context with fakes builds");
    Harness {
        runtime,
        snapshots,
        sink,
        context,
    }
}
