use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::container::{ContainerControl, ContainerSummary};

#[derive(Default)]
struct SimState {
    running: BTreeMap<String, bool>,
    calls: Vec<String>,
    fail_stop: bool,
    /// Stop the container, then report failure anyway (a timed-out CLI).
    stop_then_fail: bool,
    fail_start: bool,
}

/// In-memory container runtime. Records every call and can be told to fail
/// stop/start requests.
#[derive(Clone, Default)]
pub struct SimulatedContainers {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedContainers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_running(&self, name: &str, running: bool) {
        self.lock().running.insert(name.to_string(), running);
    }

    pub fn running(&self, name: &str) -> bool {
        self.lock().running.get(name).copied().unwrap_or(false)
    }

    pub fn fail_stop(&self, fail: bool) {
        self.lock().fail_stop = fail;
    }

    pub fn stop_then_fail(&self, fail: bool) {
        self.lock().stop_then_fail = fail;
    }

    pub fn fail_start(&self, fail: bool) {
        self.lock().fail_start = fail;
    }

    /// Calls seen so far, e.g. `["is_running node", "stop node 10"]`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }
}

#[async_trait]
impl ContainerControl for SimulatedContainers {
    async fn is_running(&self, name: &str) -> Result<bool> {
        let mut state = self.lock();
        state.calls.push(format!("is_running {}", name));
        Ok(state.running.get(name).copied().unwrap_or(false))
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("stop {} {}", name, grace.as_secs()));
        if state.fail_stop {
            bail!("simulated stop failure for {}", name);
        }
        state.running.insert(name.to_string(), false);
        if state.stop_then_fail {
            bail!("docker stop -t {} {} timed out", grace.as_secs(), name);
        }
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("start {}", name));
        if state.fail_start {
            bail!("simulated start failure for {}", name);
        }
        state.running.insert(name.to_string(), true);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .lock()
            .running
            .iter()
            .map(|(name, running)| ContainerSummary {
                name: name.clone(),
                status: if *running { "running" } else { "exited" }.to_string(),
            })
            .collect())
    }
}
