use crate::{
    runtime::{ContainerRuntime, ExecOutput},
    Error, Result,
};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of waiting for a readiness marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Marker seen on the given attempt (1-based)
    Ready { attempt: u32 },
    /// Marker never appeared; the caller carries on regardless
    TimedOut { attempts: u32 },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

/// Watches container output and runs one-shot commands
#[derive(Clone)]
pub struct ReadinessMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    attempts: u32,
    interval: Duration,
}

impl ReadinessMonitor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, attempts: u32, interval: Duration) -> Self {
        Self {
            runtime,
            attempts,
            interval,
        }
    }

    /// Poll the container's output until a line matches `marker`.
    ///
    /// Gives up after the configured number of attempts and reports
    /// [`Readiness::TimedOut`] instead of failing. Output that cannot be read
    /// on one attempt counts as "not ready yet".
    pub async fn wait_for_marker(&self, container_id: &str, marker: &str) -> Result<Readiness> {
        let pattern = Regex::new(marker)
            .map_err(|e| Error::Config(format!("invalid readiness marker {:?}: {}", marker, e)))?;

        for attempt in 1..=self.attempts {
            match self.runtime.container_logs(container_id).await {
                Ok(lines) if lines.iter().any(|line| pattern.is_match(line)) => {
                    tracing::info!(container = container_id, attempt, "Readiness marker found");
                    return Ok(Readiness::Ready { attempt });
                }
                Ok(_) => {
                    tracing::debug!(container = container_id, attempt, "Not ready yet");
                }
                Err(e) => {
                    tracing::debug!(container = container_id, attempt, error = %e, "Failed to read output");
                }
            }

            if attempt < self.attempts && !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
        }

        tracing::warn!(
            container = container_id,
            attempts = self.attempts,
            "Readiness marker not seen, continuing anyway"
        );
        Ok(Readiness::TimedOut {
            attempts: self.attempts,
        })
    }

    /// Run a command in a container and collect every line it prints
    pub async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput> {
        tracing::debug!(container = container_id, cmd = ?cmd, "Executing");
        let output = self.runtime.exec(container_id, cmd).await?;
        for line in &output.lines {
            tracing::trace!(container = container_id, "{}", line);
        }
        tracing::debug!(
            container = container_id,
            exit_code = ?output.exit_code,
            lines = output.lines.len(),
            "Exec finished"
        );
        Ok(output)
    }

    /// Run `sh -c <script>` in a container
    pub async fn exec_shell(&self, container_id: &str, script: &str) -> Result<ExecOutput> {
        let cmd = ["sh", "-c", script].map(String::from);
        self.exec(container_id, &cmd).await
    }
}

/// Escape a string for safe use in shell commands
pub(crate) fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '/' || c == '.')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("simple"), "simple");
        assert_eq!(shell_escape("/var/www/html/wp-content"), "/var/www/html/wp-content");
        assert_eq!(shell_escape("hello world"), "'hello world'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn default_marker_skips_bootstrap_server() {
        let marker = Regex::new(&crate::EnvironmentSettings::default().readiness_marker).unwrap();
        let bootstrap = "Version: '5.7.44'  socket: '/var/run/mysqld/mysqld.sock'  port: 0  MySQL Community Server (GPL)";
        let serving = "Version: '5.7.44'  socket: '/var/run/mysqld/mysqld.sock'  port: 3306  MySQL Community Server (GPL)";
        assert!(!marker.is_match(bootstrap));
        assert!(!marker.is_match("[Note] mysqld: ready for connections."));
        assert!(marker.is_match(serving));
    }
}
