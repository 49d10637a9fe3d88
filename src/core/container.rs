use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::error::JobError;

/// Control surface of whatever runs the node (Docker, systemd, a simulator).
#[async_trait]
pub trait ContainerControl: Send + Sync {
    async fn is_running(&self, name: &str) -> anyhow::Result<bool>;

    async fn stop(&self, name: &str, grace: Duration) -> anyhow::Result<()>;

    async fn start(&self, name: &str) -> anyhow::Result<()>;

    /// Containers known to the runtime, for display only.
    async fn list(&self) -> anyhow::Result<Vec<ContainerSummary>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSummary {
    pub name: String,
    pub status: String,
}

/// Stops the companion container before destructive work and brings it back
/// afterwards, whatever the outcome.
#[derive(Clone)]
pub struct ContainerGuard {
    control: Arc<dyn ContainerControl>,
    stop_grace: Duration,
}

impl ContainerGuard {
    pub fn new(control: Arc<dyn ContainerControl>, stop_grace: Duration) -> Self {
        Self {
            control,
            stop_grace,
        }
    }

    pub async fn is_running(&self, name: &str) -> Result<bool, JobError> {
        self.control.is_running(name).await.map_err(|e| {
            JobError::ContainerControl(format!("Failed to query {}: {:#}", name, e))
        })
    }

    /// Stop a container that `is_running` reported as up. A failed stop may
    /// still have stopped it (e.g. the CLI timed out while the runtime
    /// finished), so callers treat the container as possibly stopped either way.
    pub async fn stop(&self, name: &str) -> Result<(), JobError> {
        info!(container = %name, grace_secs = self.stop_grace.as_secs(), "Stopping container");
        self.control
            .stop(name, self.stop_grace)
            .await
            .map_err(|e| JobError::ContainerControl(format!("Failed to stop {}: {:#}", name, e)))
    }

    /// Start the container again if it was running before the job.
    pub async fn restore_if_needed(&self, name: &str, was_running: bool) -> Result<(), JobError> {
        if !was_running {
            return Ok(());
        }

        info!(container = %name, "Restarting container");
        self.control.start(name).await.map_err(|e| {
            let detail = format!("{:#}", e);
            warn!(container = %name, error = %detail, "Container restart failed");
            JobError::Restart(format!("{}: {}", name, detail))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedContainers;

    fn guard(sim: &SimulatedContainers) -> ContainerGuard {
        ContainerGuard::new(Arc::new(sim.clone()), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn stops_running_container_and_restarts_it() {
        let sim = SimulatedContainers::new();
        sim.set_running("node", true);
        let guard = guard(&sim);

        let was_running = guard.is_running("node").await.unwrap();
        assert!(was_running);
        guard.stop("node").await.unwrap();
        assert!(!sim.running("node"));

        guard.restore_if_needed("node", was_running).await.unwrap();
        assert!(sim.running("node"));
        assert_eq!(
            sim.calls(),
            vec!["is_running node", "stop node 10", "start node"]
        );
    }

    #[tokio::test]
    async fn stopped_container_is_left_alone() {
        let sim = SimulatedContainers::new();
        let guard = guard(&sim);

        assert!(!guard.is_running("node").await.unwrap());
        guard.restore_if_needed("node", false).await.unwrap();

        assert_eq!(sim.calls(), vec!["is_running node"]);
    }

    #[tokio::test]
    async fn stop_failure_is_container_control_error() {
        let sim = SimulatedContainers::new();
        sim.set_running("node", true);
        sim.fail_stop(true);

        let err = guard(&sim).stop("node").await.unwrap_err();
        assert!(matches!(err, JobError::ContainerControl(_)));
        assert!(sim.running("node"));
    }

    #[tokio::test]
    async fn start_failure_is_restart_error() {
        let sim = SimulatedContainers::new();
        sim.set_running("node", true);
        sim.fail_start(true);
        let guard = guard(&sim);

        let was_running = guard.is_running("node").await.unwrap();
        guard.stop("node").await.unwrap();
        let err = guard.restore_if_needed("node", was_running).await.unwrap_err();
        assert!(matches!(err, JobError::Restart(_)));
    }
}
