use thiserror::Error;

use super::models::JobKind;

/// Failures raised by maintenance jobs and the ledger that tracks them.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("A {kind} job is already in progress")]
    AlreadyRunning { kind: JobKind },

    #[error("No maintenance job is running")]
    NoActiveJob,

    #[error("Cancellation already requested")]
    CancelAlreadyRequested,

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid backup selection: {0}")]
    InvalidSelection(String),

    #[error("Container control failed: {0}")]
    ContainerControl(String),

    #[error("Archive failed: {0}")]
    Archive(String),

    /// Cooperative stop observed at a checkpoint. Not a fault.
    #[error("Cancelled")]
    Cancelled,

    #[error("Container restart failed: {0}")]
    Restart(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }

    pub fn backup_not_found(name: &str) -> Self {
        JobError::NotFound(format!("Backup not found: {}", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_running_names_the_kind() {
        let err = JobError::AlreadyRunning {
            kind: JobKind::Restore,
        };
        assert_eq!(err.to_string(), "A restore job is already in progress");
    }

    #[test]
    fn backup_not_found_message() {
        let err = JobError::backup_not_found("missing.tar.gz");
        assert_eq!(err.to_string(), "Backup not found: missing.tar.gz");
        assert!(!err.is_cancelled());
        assert!(JobError::Cancelled.is_cancelled());
    }
}
