//! Entry point for starting, cancelling and inspecting maintenance jobs.
//!
//! `trigger` is the only way to begin mutating the data or backup
//! directories: it claims the ledger slot, launches the worker on its own
//! task and returns immediately.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::container::{ContainerControl, ContainerSummary};
use super::error::JobError;
use super::ledger::JobLedger;
use super::models::{BackupEntry, Details, JobKind, JobStatus, JobView, TriggerResponse};
use super::naming::BackupNaming;
use super::path_guard::PathGuard;
use super::runner::{JobRequest, JobRunner, blocking};
use crate::config::AppConfig;

#[derive(Clone)]
pub struct JobController {
    ledger: JobLedger,
    runner: Arc<JobRunner>,
    control: Arc<dyn ContainerControl>,
    naming: BackupNaming,
    backup_dir: PathBuf,
    default_container: Option<String>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl JobController {
    pub fn new(config: &AppConfig, control: Arc<dyn ContainerControl>) -> Result<Self> {
        config.validate()?;
        let ledger = JobLedger::new();
        let naming = BackupNaming::new(&config.backup_prefix, &config.backup_suffix)?;
        let runner = JobRunner::new(config, ledger.clone(), control.clone(), naming.clone());

        Ok(Self {
            ledger,
            runner: Arc::new(runner),
            control,
            naming,
            backup_dir: config.backup_dir.clone(),
            default_container: config.container.clone().filter(|c| !c.trim().is_empty()),
            worker: Arc::new(Mutex::new(None)),
        })
    }

    fn worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a job in the background and return once it is accepted or
    /// rejected.
    pub async fn trigger(
        &self,
        kind: JobKind,
        container: Option<String>,
        backup: Option<String>,
    ) -> TriggerResponse {
        match self.try_trigger(kind, container, backup).await {
            Ok(message) => TriggerResponse::accepted(message),
            Err(e) => {
                warn!(kind = %kind, error = %e, "Maintenance job rejected");
                TriggerResponse::rejected(e.to_string())
            }
        }
    }

    async fn try_trigger(
        &self,
        kind: JobKind,
        container: Option<String>,
        backup: Option<String>,
    ) -> Result<String, JobError> {
        if self.ledger.is_active() {
            let running = self.ledger.snapshot().kind.unwrap_or(kind);
            return Err(JobError::AlreadyRunning { kind: running });
        }

        let container = container
            .filter(|c| !c.trim().is_empty())
            .or_else(|| self.default_container.clone());
        let backup = backup.map(|b| b.trim().to_string()).filter(|b| !b.is_empty());

        let selected = if kind.needs_backup_name() {
            let name = backup
                .clone()
                .ok_or_else(|| JobError::InvalidSelection("no backup selected".into()))?;
            Some(name)
        } else {
            None
        };
        let backup_dir = self.backup_dir.clone();
        blocking(move || check_selection(&backup_dir, selected.as_deref())).await?;

        let mut details = Details::new();
        if let Some(container) = &container {
            details.insert("container".into(), container.clone().into());
        }
        if let Some(backup) = &backup {
            details.insert("backup".into(), backup.clone().into());
        }

        let ticket = self
            .ledger
            .start(kind, format!("Starting {}", kind), details)?;
        info!(job_id = %ticket.id, kind = %kind, "Maintenance job accepted");

        let request = JobRequest {
            kind,
            container,
            backup,
        };
        let runner = self.runner.clone();
        let ledger = self.ledger.clone();
        let job_id = ticket.id;

        let handle = tokio::spawn(async move {
            let job = tokio::spawn(async move { runner.execute(request, ticket).await });
            if let Err(e) = job.await {
                error!(job_id = %job_id, error = %e, "Maintenance worker crashed");
                if ledger.is_active() {
                    ledger.finish(JobStatus::Error, format!("Worker crashed: {}", e), None);
                }
            }
        });
        *self.worker() = Some(handle);

        Ok(format!("Started {} job", kind))
    }

    /// Ask the active job to stop. A container name, when given, must match
    /// the container the active job is guarding.
    pub fn request_cancel(&self, container: Option<&str>) -> TriggerResponse {
        let view = self.ledger.snapshot();

        if let (true, Some(requested)) = (view.active, container.filter(|c| !c.is_empty())) {
            if let Some(active) = view.details.get("container").and_then(|v| v.as_str()) {
                if active != requested {
                    return TriggerResponse::rejected(format!(
                        "Active job targets container {}, not {}",
                        active, requested
                    ));
                }
            }
        }

        match self.ledger.request_cancel() {
            Ok(()) => {
                let kind = view.kind.map(|k| k.as_str()).unwrap_or("maintenance");
                info!(kind, "Cancellation requested");
                TriggerResponse::accepted(format!("Cancellation requested for {} job", kind))
            }
            Err(e) => TriggerResponse::rejected(e.to_string()),
        }
    }

    pub fn snapshot(&self) -> JobView {
        self.ledger.snapshot()
    }

    /// Wait for the most recently started worker to finish.
    pub async fn wait(&self) -> JobView {
        let handle = self.worker().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Failed to join maintenance worker");
            }
        }
        self.ledger.snapshot()
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupEntry>, JobError> {
        let naming = self.naming.clone();
        let dir = self.backup_dir.clone();
        blocking(move || Ok(naming.list(&dir)?)).await
    }

    pub async fn containers(&self) -> Vec<ContainerSummary> {
        match self.control.list().await {
            Ok(list) => list,
            Err(e) => {
                let detail = format!("{:#}", e);
                warn!(error = %detail, "Failed to list containers");
                Vec::new()
            }
        }
    }
}

/// Backup directory must exist (it is created on demand). A named backup must
/// resolve inside it and be a regular file.
fn check_selection(backup_dir: &Path, backup: Option<&str>) -> Result<(), JobError> {
    fs::create_dir_all(backup_dir).map_err(|e| {
        JobError::NotFound(format!(
            "Backup directory unavailable: {}: {}",
            backup_dir.display(),
            e
        ))
    })?;

    if let Some(name) = backup {
        let path = PathGuard::new(backup_dir)?.resolve(name)?;
        if !path.is_file() {
            return Err(JobError::backup_not_found(name));
        }
    }
    Ok(())
}
