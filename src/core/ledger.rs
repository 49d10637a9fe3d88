//! Single-slot record of the current (or last finished) maintenance job.
//!
//! Every operation takes one short-held mutex and never performs I/O while
//! holding it, so HTTP handlers reading `snapshot()` are never stuck behind
//! a long-running archive step. `active` is the only concurrency gate: the
//! last `status` is kept purely for reporting until the next job overwrites it.

use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::error::JobError;
use super::models::{Details, JobKind, JobStatus, JobView};

/// Handed to the worker that won `start()`.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub id: Uuid,
    pub kind: JobKind,
    pub token: CancellationToken,
}

#[derive(Default)]
struct LedgerState {
    view: JobView,
    cancel: Option<CancellationToken>,
    cancel_requested: bool,
}

#[derive(Clone, Default)]
pub struct JobLedger {
    inner: Arc<Mutex<LedgerState>>,
}

impl JobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking worker must not wedge the dashboard.
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the slot. Fails without touching the running job if one is active.
    pub fn start(
        &self,
        kind: JobKind,
        message: impl Into<String>,
        details: Details,
    ) -> Result<JobTicket, JobError> {
        let mut state = self.lock();

        if state.view.active {
            let running = state.view.kind.unwrap_or(kind);
            return Err(JobError::AlreadyRunning { kind: running });
        }

        let ticket = JobTicket {
            id: Uuid::now_v7(),
            kind,
            token: CancellationToken::new(),
        };

        state.view = JobView {
            id: Some(ticket.id),
            kind: Some(kind),
            status: JobStatus::Running,
            active: true,
            message: message.into(),
            started_at: Some(Utc::now()),
            ended_at: None,
            details,
        };
        state.cancel = Some(ticket.token.clone());
        state.cancel_requested = false;

        Ok(ticket)
    }

    /// Merge `patch` into the details and replace the message. Dropped once
    /// the job is no longer active.
    pub fn progress(&self, message: impl Into<String>, patch: Details) {
        let mut state = self.lock();
        if !state.view.active {
            debug!("Dropping progress report for inactive job");
            return;
        }
        state.view.message = message.into();
        state.view.details.extend(patch);
    }

    /// Record the terminal state. `details` is merged over what the job
    /// already reported, so flags set by other callers (cancellation) survive.
    pub fn finish(&self, status: JobStatus, message: impl Into<String>, details: Option<Details>) {
        let mut state = self.lock();
        state.view.active = false;
        state.view.status = status;
        state.view.message = message.into();
        state.view.ended_at = Some(Utc::now());
        if let Some(details) = details {
            state.view.details.extend(details);
        }
        state.cancel = None;
        state.cancel_requested = false;
    }

    pub fn snapshot(&self) -> JobView {
        self.lock().view.clone()
    }

    pub fn is_active(&self) -> bool {
        self.lock().view.active
    }

    pub fn request_cancel(&self) -> Result<(), JobError> {
        let mut state = self.lock();

        if !state.view.active {
            return Err(JobError::NoActiveJob);
        }
        if state.cancel_requested {
            return Err(JobError::CancelAlreadyRequested);
        }

        if let Some(token) = &state.cancel {
            token.cancel();
        }
        state.cancel_requested = true;
        state.view.status = JobStatus::Cancelling;
        state.view.message = "Cancellation requested".to_string();
        state
            .view
            .details
            .insert("cancel_requested".into(), Value::Bool(true));
        state.view.details.insert(
            "cancel_requested_at".into(),
            Value::String(Utc::now().to_rfc3339()),
        );

        Ok(())
    }
}
