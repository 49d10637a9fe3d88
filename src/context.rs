use anyhow::Result;
use std::sync::Arc;

use crate::adapters;
use crate::config::AppConfig;
use crate::core::{ContainerControl, JobController};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub jobs: JobController,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Result<Self> {
        let control = adapters::get_container_control(config.docker_enabled);
        Self::with_control(config, control)
    }

    pub fn with_control(config: AppConfig, control: Arc<dyn ContainerControl>) -> Result<Self> {
        let jobs = JobController::new(&config, control)?;
        Ok(Self {
            config: Arc::new(config),
            jobs,
        })
    }
}
