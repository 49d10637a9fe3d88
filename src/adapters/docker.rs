use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::core::container::{ContainerControl, ContainerSummary};

const QUERY_TIMEOUT: Duration = Duration::from_secs(3);
const START_TIMEOUT: Duration = Duration::from_secs(15);
/// Added on top of the stop grace period before `docker stop` is abandoned.
const STOP_SLACK: Duration = Duration::from_secs(5);

/// Drives containers through the `docker` CLI.
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn docker(&self, args: &[&str], limit: Duration) -> Result<String> {
        debug!(args = ?args, "Running docker");

        let output = timeout(limit, Command::new(&self.binary).args(args).output())
            .await
            .map_err(|_| anyhow!("docker {} timed out after {}s", args.join(" "), limit.as_secs()))?
            .with_context(|| format!("Failed to run {}", self.binary))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() { stdout } else { stderr };
            bail!("docker {} failed ({}): {}", args.join(" "), output.status, detail);
        }

        Ok(stdout)
    }
}

#[async_trait]
impl ContainerControl for DockerCli {
    async fn is_running(&self, name: &str) -> Result<bool> {
        let out = self
            .docker(&["inspect", "-f", "{{.State.Running}}", name], QUERY_TIMEOUT)
            .await?;
        Ok(out == "true")
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        self.docker(&["stop", "-t", &secs, name], grace + STOP_SLACK)
            .await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.docker(&["start", name], START_TIMEOUT).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ContainerSummary>> {
        let out = self
            .docker(
                &["ps", "-a", "--format", "{{.Names}}|{{.Status}}"],
                QUERY_TIMEOUT,
            )
            .await?;
        Ok(parse_ps(&out))
    }
}

fn parse_ps(out: &str) -> Vec<ContainerSummary> {
    out.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (name, status) = line.split_once('|').unwrap_or((line, ""));
            ContainerSummary {
                name: name.trim().to_string(),
                status: status.trim().to_string(),
            }
        })
        .collect()
}
