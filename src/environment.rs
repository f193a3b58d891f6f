use crate::{
    builder::RunContext,
    config::{DatabaseCredentials, SuiteConfig},
    containers::{ContainerOrchestrator, ServiceRole},
    images::ImageProvisioner,
    network::{generate_network_id, NetworkManager},
    readiness::{shell_escape, Readiness, ReadinessMonitor},
    registry::EnvironmentInfo,
    runtime::{ContainerSpec, ExecOutput},
    snapshot::{InjectionTarget, SnapshotInjector},
    Error, Result,
};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

const APPLICATION_PORT: u16 = 80;
const BROWSER_DRIVER_PORT: u16 = 4444;
const BROWSER_SHM_SIZE: i64 = 2 * 1024 * 1024 * 1024;

/// Which part of the teardown a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    StopContainer,
    RemoveContainer,
    DeleteNetwork,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            TeardownStep::StopContainer => "stop container",
            TeardownStep::RemoveContainer => "remove container",
            TeardownStep::DeleteNetwork => "delete network",
        };
        f.write_str(step)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownError {
    pub step: TeardownStep,
    pub resource: String,
    pub message: String,
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.step, self.resource, self.message)
    }
}

/// Everything that went wrong while tearing an environment down.
///
/// Every step is attempted regardless of earlier failures; a non-empty
/// report means resources may have been left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub errors: Vec<TeardownError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn record(&mut self, step: TeardownStep, failures: Vec<(String, Error)>) {
        self.errors
            .extend(failures.into_iter().map(|(resource, e)| TeardownError {
                step,
                resource,
                message: e.to_string(),
            }));
    }

    fn log(&self, network_id: &str) {
        if self.is_clean() {
            tracing::info!(network = network_id, "Environment torn down");
            return;
        }
        for error in &self.errors {
            tracing::error!(network = network_id, "Teardown failed to {}", error);
        }
    }
}

/// One isolated WordPress stack: a network, a database, the application
/// server and a browser driver, with a snapshot loaded and the repository
/// under test copied in.
///
/// Call [`Environment::destroy`] when done. Dropping an environment that was
/// not destroyed runs the same teardown unless containers are preserved.
pub struct Environment {
    context: Arc<RunContext>,
    network_id: String,
    gateway_ip: Ipv4Addr,
    application_port: u16,
    browser_driver_port: u16,
    snapshot_id: String,
    suite: Arc<SuiteConfig>,
    containers: ContainerOrchestrator,
    monitor: ReadinessMonitor,
    codebase: Option<String>,
    clean_db: bool,
    destroyed: bool,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("network_id", &self.network_id)
            .field("application_port", &self.application_port)
            .field("browser_driver_port", &self.browser_driver_port)
            .field("gateway_ip", &self.gateway_ip)
            .field("snapshot_id", &self.snapshot_id)
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Provision a complete environment.
    ///
    /// Steps run strictly in order: network, images, ports, containers,
    /// start, database readiness, running check, snapshot injection and the
    /// clean database dump. If any step fails, whatever was provisioned so far
    /// is torn down before the error is returned.
    pub async fn create(
        context: Arc<RunContext>,
        snapshot_id: &str,
        suite: Arc<SuiteConfig>,
    ) -> Result<Self> {
        let settings = context.settings();
        let runtime = Arc::clone(context.runtime());
        let network_id = generate_network_id(&settings.name_prefix);
        let monitor = ReadinessMonitor::new(
            Arc::clone(&runtime),
            settings.readiness_attempts,
            settings.readiness_interval,
        );

        let mut env = Self {
            network_id,
            gateway_ip: Ipv4Addr::UNSPECIFIED,
            application_port: 0,
            browser_driver_port: 0,
            snapshot_id: snapshot_id.to_string(),
            suite,
            containers: ContainerOrchestrator::new(runtime),
            monitor,
            codebase: None,
            clean_db: false,
            destroyed: false,
            context,
        };

        env.context
            .reporter()
            .info(0, format!("Creating environment {}...", env.network_id));

        if let Err(e) = env.provision().await {
            env.context
                .reporter()
                .error(0, format!("Failed to create environment: {}", e));
            let report = env.teardown().await;
            report.log(&env.network_id);
            env.destroyed = true;
            return Err(e);
        }

        env.context.reporter().success(
            0,
            format!(
                "Environment {} ready at {}",
                env.network_id,
                env.wp_home_url()
            ),
        );
        Ok(env)
    }

    async fn provision(&mut self) -> Result<()> {
        let context = Arc::clone(&self.context);
        let settings = context.settings();
        let runtime = Arc::clone(context.runtime());

        self.gateway_ip = NetworkManager::new(Arc::clone(&runtime))
            .create_network(&self.network_id)
            .await?;

        let images = ImageProvisioner::new(Arc::clone(&runtime), context.reporter().clone());
        images
            .ensure_images(&[settings.database_image.clone(), settings.browser_image.clone()])
            .await?;
        images
            .ensure_built(
                &settings.application_image,
                settings.application_build_context.as_deref(),
                settings.rebuild_images,
            )
            .await?;

        let (application_port, browser_driver_port) = {
            let context = Arc::clone(&context);
            let network_id = self.network_id.clone();
            tokio::task::spawn_blocking(move || {
                let settings = context.settings();
                context.registry().allocate_ports(
                    &network_id,
                    &settings.port_host,
                    settings.port_range,
                )
            })
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("port allocation task failed: {}", e)))??
        };
        self.application_port = application_port;
        self.browser_driver_port = browser_driver_port;

        let specs = self.container_specs()?;
        self.containers.create(specs).await?;
        self.containers.start().await?;

        let database = self.container_id(ServiceRole::Database)?;
        match self
            .monitor
            .wait_for_marker(&database, &settings.readiness_marker)
            .await?
        {
            Readiness::Ready { .. } => {}
            Readiness::TimedOut { attempts } => context.reporter().warning(
                1,
                format!(
                    "Database did not report ready after {} attempts, continuing",
                    attempts
                ),
            ),
        }

        self.containers.verify_running().await?;

        let snapshot = context.snapshots().get(&self.snapshot_id).await?;
        let application = self.container_id(ServiceRole::Application)?;
        let credentials = self.database_credentials();
        let target = InjectionTarget {
            container_id: &application,
            snapshot: &snapshot,
            application_port: self.application_port,
            database: &credentials,
            project_name: &self.suite.name,
        };
        let injector = SnapshotInjector::new(&self.monitor, settings, context.reporter());
        self.codebase = Some(injector.inject(&target).await?);

        if !self.suite.disable_clean_db {
            self.dump_clean_database().await?;
        }

        context.registry().register(EnvironmentInfo {
            network_id: self.network_id.clone(),
            application_port: self.application_port,
            browser_driver_port: self.browser_driver_port,
            gateway_ip: self.gateway_ip,
            snapshot_id: self.snapshot_id.clone(),
            created_at: chrono::Utc::now(),
            active: true,
        });
        Ok(())
    }

    fn container_specs(&self) -> Result<Vec<(ServiceRole, ContainerSpec)>> {
        let settings = self.context.settings();
        let gateway = self.gateway_ip.to_string();
        let test_host = vec![(settings.test_hostname.clone(), gateway)];

        let mut database_env = vec![
            format!("MYSQL_ROOT_PASSWORD={}", settings.db_password),
            format!("MYSQL_DATABASE={}", settings.db_name),
        ];
        if settings.db_user != "root" {
            database_env.push(format!("MYSQL_USER={}", settings.db_user));
            database_env.push(format!("MYSQL_PASSWORD={}", settings.db_password));
        }

        let repository = self.suite.repository_path()?;

        Ok(vec![
            (
                ServiceRole::Database,
                ContainerSpec {
                    name: ServiceRole::Database.container_name(&self.network_id),
                    image: settings.database_image.to_string(),
                    network: self.network_id.clone(),
                    env: database_env,
                    ..Default::default()
                },
            ),
            (
                ServiceRole::Application,
                ContainerSpec {
                    name: ServiceRole::Application.container_name(&self.network_id),
                    image: settings.application_image.to_string(),
                    hostname: Some(settings.test_hostname.clone()),
                    network: self.network_id.clone(),
                    port_bindings: vec![(APPLICATION_PORT, self.application_port)],
                    binds: vec![
                        (
                            settings.snapshots_dir.display().to_string(),
                            settings.snapshots_mount.clone(),
                        ),
                        (
                            repository.display().to_string(),
                            settings.repository_mount.clone(),
                        ),
                    ],
                    extra_hosts: test_host.clone(),
                    ..Default::default()
                },
            ),
            (
                ServiceRole::BrowserDriver,
                ContainerSpec {
                    name: ServiceRole::BrowserDriver.container_name(&self.network_id),
                    image: settings.browser_image.to_string(),
                    network: self.network_id.clone(),
                    port_bindings: vec![(BROWSER_DRIVER_PORT, self.browser_driver_port)],
                    extra_hosts: test_host,
                    shm_size: Some(BROWSER_SHM_SIZE),
                    ..Default::default()
                },
            ),
        ])
    }

    fn container_id(&self, role: ServiceRole) -> Result<String> {
        self.containers
            .handle(role)
            .map(|h| h.id.clone())
            .ok_or_else(|| Error::Other(anyhow::anyhow!("no {} container in environment", role)))
    }

    fn mysql_args(&self, tool: &str) -> String {
        let db = self.database_credentials();
        format!(
            "{} --host={} --user={} --password={} {}",
            tool,
            shell_escape(&db.host),
            shell_escape(&db.user),
            shell_escape(&db.password),
            shell_escape(&db.name)
        )
    }

    async fn dump_clean_database(&mut self) -> Result<()> {
        let application = self.container_id(ServiceRole::Application)?;
        let script = format!(
            "{} > {}",
            self.mysql_args("mysqldump"),
            shell_escape(&self.context.settings().clean_db_dump)
        );
        let output = self.monitor.exec_shell(&application, &script).await?;
        if !output.success() {
            return Err(Error::Other(anyhow::anyhow!(
                "failed to dump clean database: {}",
                output.tail(5)
            )));
        }
        self.clean_db = true;
        tracing::debug!(network = %self.network_id, "Saved clean database copy");
        Ok(())
    }

    /// Restore the database to the state right after snapshot injection
    pub async fn reset_database(&self) -> Result<()> {
        if !self.clean_db {
            return Err(Error::Config(format!(
                "no clean database copy for suite {:?}",
                self.suite.name
            )));
        }
        let application = self.container_id(ServiceRole::Application)?;
        let script = format!(
            "{} < {}",
            self.mysql_args("mysql"),
            shell_escape(&self.context.settings().clean_db_dump)
        );
        let output = self.monitor.exec_shell(&application, &script).await?;
        if !output.success() {
            return Err(Error::Other(anyhow::anyhow!(
                "failed to restore clean database: {}",
                output.tail(5)
            )));
        }
        self.context.reporter().info(2, "Restored clean database");
        Ok(())
    }

    /// Tear the environment down: stop containers, remove them, delete the
    /// network. Never fails; every problem ends up in the returned report.
    /// Calling it again is a no-op.
    pub async fn destroy(&mut self) -> TeardownReport {
        if self.destroyed {
            return TeardownReport::default();
        }
        self.destroyed = true;

        if self.context.settings().preserve_containers {
            self.context.reporter().warning(
                0,
                format!("Keeping containers of environment {}", self.network_id),
            );
            self.context.registry().deactivate(&self.network_id);
            return TeardownReport::default();
        }

        self.context
            .reporter()
            .info(1, format!("Destroying environment {}...", self.network_id));
        let report = self.teardown().await;
        report.log(&self.network_id);
        report
    }

    async fn teardown(&mut self) -> TeardownReport {
        teardown(&self.context, &mut self.containers, &self.network_id).await
    }

    /// Run a command inside one of the environment's containers
    pub async fn exec(&self, role: ServiceRole, cmd: &[String]) -> Result<ExecOutput> {
        let id = self.container_id(role)?;
        self.monitor.exec(&id, cmd).await
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn application_port(&self) -> u16 {
        self.application_port
    }

    pub fn browser_driver_port(&self) -> u16 {
        self.browser_driver_port
    }

    pub fn gateway_ip(&self) -> Ipv4Addr {
        self.gateway_ip
    }

    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    pub fn suite(&self) -> &SuiteConfig {
        &self.suite
    }

    /// Directory inside the application container the repository was copied to
    pub fn codebase_dir(&self) -> Option<&str> {
        self.codebase.as_deref()
    }

    /// Site URL as the browser driver sees it
    pub fn wp_home_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.context.settings().test_hostname,
            self.application_port
        )
    }

    /// WebDriver endpoint reachable from the host
    pub fn browser_driver_url(&self) -> String {
        format!(
            "http://{}:{}/wd/hub",
            self.context.settings().port_host,
            self.browser_driver_port
        )
    }

    pub fn database_credentials(&self) -> DatabaseCredentials {
        self.context.settings().database_credentials(&self.network_id)
    }

    pub fn containers(&self) -> &ContainerOrchestrator {
        &self.containers
    }
}

async fn teardown(
    context: &RunContext,
    containers: &mut ContainerOrchestrator,
    network_id: &str,
) -> TeardownReport {
    let mut report = TeardownReport::default();

    report.record(TeardownStep::StopContainer, containers.stop_all().await);
    report.record(TeardownStep::RemoveContainer, containers.remove_all().await);

    if let Err(e) = NetworkManager::new(Arc::clone(context.runtime()))
        .delete_network(network_id)
        .await
    {
        report.record(
            TeardownStep::DeleteNetwork,
            vec![(network_id.to_string(), e)],
        );
    }

    context.registry().deactivate(network_id);
    report
}

impl Drop for Environment {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        if self.context.settings().preserve_containers {
            tracing::info!(network = %self.network_id, "Leaving preserved environment running");
            return;
        }

        tracing::info!(network = %self.network_id, "Environment dropped without destroy, cleaning up");
        self.destroyed = true;

        let context = Arc::clone(&self.context);
        let network_id = self.network_id.clone();
        let mut containers = std::mem::replace(
            &mut self.containers,
            ContainerOrchestrator::new(Arc::clone(context.runtime())),
        );
        let cleanup = async move {
            let report = teardown(&context, &mut containers, &network_id).await;
            report.log(&network_id);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => match handle.runtime_flavor() {
                tokio::runtime::RuntimeFlavor::CurrentThread => {
                    // block_in_place panics on a current-thread runtime
                    tracing::warn!(
                        network = %self.network_id,
                        "Teardown spawned in the background; resources leak if the runtime stops first"
                    );
                    handle.spawn(cleanup);
                }
                _ => tokio::task::block_in_place(|| handle.block_on(cleanup)),
            },
            Err(_) => match tokio::runtime::Runtime::new() {
                Ok(rt) => rt.block_on(cleanup),
                Err(e) => tracing::error!("Failed to create runtime for cleanup: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_collects_every_failure() {
        let mut report = TeardownReport::default();
        assert!(report.is_clean());

        report.record(
            TeardownStep::StopContainer,
            vec![
                ("mysql-x".to_string(), Error::Config("boom".into())),
                ("selenium-x".to_string(), Error::Config("bang".into())),
            ],
        );
        report.record(TeardownStep::RemoveContainer, Vec::new());

        assert!(!report.is_clean());
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.errors[1].resource, "selenium-x");
        assert_eq!(
            report.errors[0].to_string(),
            "stop container mysql-x: Invalid configuration: boom"
        );
    }
}
