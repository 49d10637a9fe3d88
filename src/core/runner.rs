//! Job bodies for backup, restore and delete.
//!
//! Each body checks the cancellation token before every destructive step and
//! returns `JobError::Cancelled` when it sees it. `execute` is the boundary:
//! whatever a body returns is turned into a terminal ledger state, the
//! container is restarted if it was stopped, and nothing escapes as a panic
//! or error to the caller.

use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span, warn};

use super::archive::ArchiveEngine;
use super::container::{ContainerControl, ContainerGuard};
use super::error::JobError;
use super::ledger::{JobLedger, JobTicket};
use super::models::{Details, JobKind, JobStatus};
use super::naming::BackupNaming;
use super::path_guard::PathGuard;
use super::rename_aside::RenameAside;
use super::retention;
use crate::config::AppConfig;

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKind,
    pub container: Option<String>,
    pub backup: Option<String>,
}

pub struct JobRunner {
    ledger: JobLedger,
    archive: ArchiveEngine,
    containers: ContainerGuard,
    naming: BackupNaming,
    data_dir: PathBuf,
    backup_dir: PathBuf,
    max_backups: usize,
}

/// Reporting handle for one job. Keeps its own copy of the details so the
/// terminal ledger write carries everything reported along the way.
struct JobScope<'a> {
    ledger: &'a JobLedger,
    ticket: JobTicket,
    message: String,
    details: Details,
}

impl<'a> JobScope<'a> {
    fn report(&mut self, message: impl Into<String>, patch: Details) {
        self.message = message.into();
        self.details.extend(patch.clone());
        self.ledger.progress(self.message.clone(), patch);
    }

    fn note(&mut self, key: &str, value: impl Into<Value>) {
        let message = self.message.clone();
        self.report(message, detail(key, value));
    }

    fn checkpoint(&self) -> Result<(), JobError> {
        if self.ticket.token.is_cancelled() {
            info!("Cancellation observed");
            return Err(JobError::Cancelled);
        }
        Ok(())
    }
}

/// Run filesystem work on the blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, JobError>
where
    F: FnOnce() -> Result<T, JobError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| JobError::Io(std::io::Error::other(e)))?
}

pub(crate) fn detail(key: &str, value: impl Into<Value>) -> Details {
    let mut details = Details::new();
    details.insert(key.to_string(), value.into());
    details
}

fn title(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Backup => "Backup",
        JobKind::Restore => "Restore",
        JobKind::Delete => "Delete",
    }
}

impl JobRunner {
    pub fn new(
        config: &AppConfig,
        ledger: JobLedger,
        control: Arc<dyn ContainerControl>,
        naming: BackupNaming,
    ) -> Self {
        Self {
            ledger,
            archive: ArchiveEngine::new(
                config.tar_command.clone(),
                config.poll_interval(),
                config.terminate_grace(),
            ),
            containers: ContainerGuard::new(control, config.stop_grace()),
            naming,
            data_dir: config.data_dir.clone(),
            backup_dir: config.backup_dir.clone(),
            max_backups: config.max_backups,
        }
    }

    /// Run one job to completion and record its terminal state.
    pub async fn execute(&self, request: JobRequest, ticket: JobTicket) {
        let span = info_span!(
            "maintenance_job",
            job_id = %ticket.id,
            kind = %request.kind,
            container = request.container.as_deref().unwrap_or("-"),
        );
        self.execute_inner(request, ticket).instrument(span).await
    }

    async fn execute_inner(&self, request: JobRequest, ticket: JobTicket) {
        let snapshot = self.ledger.snapshot();
        let mut scope = JobScope {
            ledger: &self.ledger,
            ticket,
            message: snapshot.message,
            details: snapshot.details,
        };

        info!("Maintenance job started");

        // Deleting a backup file never touches the live data directory.
        let container = request
            .container
            .as_deref()
            .filter(|_| request.kind.touches_data_dir());

        let mut was_running = false;
        let mut aborted = None;
        if let Some(name) = container {
            scope.report(format!("Stopping container {}", name), Details::new());
            match self.containers.is_running(name).await {
                Ok(running) => {
                    was_running = running;
                    scope.note("container_was_running", running);
                    if running {
                        aborted = self.containers.stop(name).await.err();
                    }
                }
                Err(e) => aborted = Some(e),
            }
        }

        let result = match aborted {
            Some(e) => {
                error!(error = %e, "Aborting job before any filesystem change");
                Err(e)
            }
            None => match request.kind {
                JobKind::Backup => self.backup(&mut scope).await,
                JobKind::Restore => self.restore(&mut scope, request.backup.as_deref()).await,
                JobKind::Delete => self.delete(&mut scope, request.backup.as_deref()).await,
            },
        };

        let (mut status, mut message) = match &result {
            Ok(summary) => (JobStatus::Success, summary.clone()),
            Err(e) if e.is_cancelled() => (
                JobStatus::Cancelled,
                format!("{} cancelled", title(request.kind)),
            ),
            Err(e) => {
                scope.details.insert("error".into(), e.to_string().into());
                (JobStatus::Error, e.to_string())
            }
        };

        if let Some(name) = container {
            match self.containers.restore_if_needed(name, was_running).await {
                Ok(()) if was_running => {
                    scope.details.insert("container_restarted".into(), true.into());
                }
                Ok(()) => {}
                Err(e) => {
                    // The artifact details stay; the node is just not confirmed up.
                    status = JobStatus::Error;
                    message = format!("{}; {}", message, e);
                    scope
                        .details
                        .insert("restart_error".into(), e.to_string().into());
                }
            }
        }

        if request.kind == JobKind::Backup && result.is_ok() {
            self.prune(&mut scope).await;
        }

        match status {
            JobStatus::Success => info!(%message, "Maintenance job succeeded"),
            JobStatus::Cancelled => info!(%message, "Maintenance job cancelled"),
            _ => error!(%message, "Maintenance job failed"),
        }

        self.ledger.finish(status, message, Some(scope.details));
    }

    async fn backup(&self, scope: &mut JobScope<'_>) -> Result<String, JobError> {
        scope.checkpoint()?;
        tokio::fs::create_dir_all(&self.backup_dir).await?;
        if !is_dir(&self.data_dir).await {
            return Err(JobError::NotFound(format!(
                "Data directory not found: {}",
                self.data_dir.display()
            )));
        }

        scope.checkpoint()?;
        let naming = self.naming.clone();
        let dir = self.backup_dir.clone();
        let destination = blocking(move || Ok(naming.next_destination(&dir, Utc::now()))).await?;
        let name = file_name(&destination);

        let mut patch = detail("backup", name.clone());
        patch.insert("path".into(), destination.display().to_string().into());
        scope.report(format!("Creating backup {}", name), patch);

        let token = scope.ticket.token.clone();
        let ledger = &self.ledger;
        let size = self
            .archive
            .create(&self.data_dir, &destination, &token, |progress| {
                let secs = progress.elapsed.as_secs();
                let mut patch = detail("bytes_written", progress.bytes_written);
                patch.insert("elapsed_secs".into(), secs.into());
                ledger.progress(format!("Creating backup {} ({}s)", name, secs), patch);
            })
            .await?;

        scope.report(format!("Backup {} created", name), detail("size", size));
        Ok(format!("Backup created: {}", name))
    }

    async fn restore(
        &self,
        scope: &mut JobScope<'_>,
        name: Option<&str>,
    ) -> Result<String, JobError> {
        let name = name.ok_or_else(|| JobError::InvalidSelection("no backup selected".into()))?;

        scope.checkpoint()?;
        let archive = self.existing_backup(name).await?;
        let parent = self.data_dir_parent()?;
        tokio::fs::create_dir_all(&parent).await?;

        scope.checkpoint()?;
        let strays = self.inspect_backup(scope, &archive, &parent, name).await?;

        scope.checkpoint()?;
        scope.report("Moving current data directory aside", Details::new());
        let live = self.data_dir.clone();
        let aside = blocking(move || Ok(RenameAside::set_aside(&live)?)).await?;
        if let Some(path) = aside.aside_path() {
            scope.note("aside_path", path.display().to_string());
        }

        match self.extract_into_place(scope, &archive, &parent, name).await {
            Ok(()) => {
                scope.report("Removing previous data directory", Details::new());
                if let Err(e) = tokio::task::spawn_blocking(move || aside.commit()).await {
                    warn!(error = %e, "Cleanup of previous data directory did not finish");
                }
                scope.report(format!("Restored backup {}", name), Details::new());
                Ok(format!("Restored backup {}", name))
            }
            Err(e) => {
                scope.report("Rolling back data directory", Details::new());
                let rollback = move || {
                    remove_strays(&strays);
                    aside.rollback()
                };
                match tokio::task::spawn_blocking(rollback).await {
                    Ok(Ok(())) => {
                        scope.note("rolled_back", true);
                        Err(e)
                    }
                    Ok(Err(rollback)) => {
                        error!(error = %rollback, "Data directory rollback failed");
                        scope.note("rollback_error", rollback.to_string());
                        Err(JobError::Archive(format!("{}; rollback failed: {}", e, rollback)))
                    }
                    Err(join) => {
                        error!(error = %join, "Data directory rollback did not finish");
                        Err(JobError::Archive(format!("{}; rollback failed: {}", e, join)))
                    }
                }
            }
        }
    }

    /// Checks the archive holds the data directory and returns the paths of
    /// any other top-level entries it would create next to it.
    async fn inspect_backup(
        &self,
        scope: &mut JobScope<'_>,
        archive: &Path,
        parent: &Path,
        name: &str,
    ) -> Result<Vec<PathBuf>, JobError> {
        scope.report(format!("Inspecting backup {}", name), Details::new());

        let token = scope.ticket.token.clone();
        let entries = self.archive.top_level_entries(archive, &token).await?;
        let live_name = file_name(&self.data_dir);

        if !entries.contains(&live_name) {
            return Err(JobError::Archive(format!(
                "Backup {} does not contain {}",
                name, live_name
            )));
        }
        // Would collide with the rollback copy.
        let reserved = format!("{}.", live_name);
        if let Some(entry) = entries.iter().find(|e| e.starts_with(&reserved)) {
            return Err(JobError::Archive(format!(
                "Backup {} contains reserved entry {}",
                name, entry
            )));
        }

        let mut strays = Vec::new();
        for entry in entries.iter().filter(|e| **e != live_name) {
            let path = parent.join(entry);
            if tokio::fs::symlink_metadata(&path).await.is_err() {
                strays.push(path);
            }
        }
        if !strays.is_empty() {
            warn!(count = strays.len(), "Backup contains entries besides the data directory");
        }
        Ok(strays)
    }

    async fn extract_into_place(
        &self,
        scope: &mut JobScope<'_>,
        archive: &Path,
        parent: &Path,
        name: &str,
    ) -> Result<(), JobError> {
        scope.checkpoint()?;
        scope.report(format!("Extracting backup {}", name), Details::new());

        let token = scope.ticket.token.clone();
        let ledger = &self.ledger;
        self.archive
            .extract(archive, parent, &token, |progress| {
                let secs = progress.elapsed.as_secs();
                ledger.progress(
                    format!("Extracting backup {} ({}s)", name, secs),
                    detail("elapsed_secs", secs),
                );
            })
            .await?;

        if !is_dir(&self.data_dir).await {
            return Err(JobError::Archive(format!(
                "Backup {} did not contain {}",
                name,
                file_name(&self.data_dir)
            )));
        }
        Ok(())
    }

    async fn delete(
        &self,
        scope: &mut JobScope<'_>,
        name: Option<&str>,
    ) -> Result<String, JobError> {
        let name = name.ok_or_else(|| JobError::InvalidSelection("no backup selected".into()))?;

        let path = self.existing_backup(name).await?;

        scope.checkpoint()?;
        tokio::fs::remove_file(&path).await?;
        info!(backup = %name, "Deleted backup");
        scope.report(format!("Deleted backup {}", name), detail("deleted", name));
        Ok(format!("Deleted backup {}", name))
    }

    /// Pruning never changes the outcome of the backup that triggered it.
    async fn prune(&self, scope: &mut JobScope<'_>) {
        let naming = self.naming.clone();
        let dir = self.backup_dir.clone();
        let max = self.max_backups;
        match blocking(move || Ok(retention::prune(&naming, &dir, max)?)).await {
            Ok(removed) if !removed.is_empty() => {
                scope.details.insert("pruned".into(), removed.into());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Backup pruning failed"),
        }
    }

    async fn existing_backup(&self, name: &str) -> Result<PathBuf, JobError> {
        let root = self.backup_dir.clone();
        let name = name.to_string();
        blocking(move || {
            let path = PathGuard::new(&root)?.resolve(&name)?;
            if !path.is_file() {
                return Err(JobError::backup_not_found(&name));
            }
            Ok(path)
        })
        .await
    }

    fn data_dir_parent(&self) -> Result<PathBuf, JobError> {
        self.data_dir
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                JobError::NotFound(format!(
                    "Data directory has no parent: {}",
                    self.data_dir.display()
                ))
            })
    }
}

/// Remove top-level entries a failed extract created next to the data
/// directory. Best-effort.
fn remove_strays(strays: &[PathBuf]) {
    for path in strays {
        let removed = match path.symlink_metadata() {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(_) => continue,
        };
        match removed {
            Ok(()) => info!(path = %path.display(), "Removed extracted entry"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove extracted entry"),
        }
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
