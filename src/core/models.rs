use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Open mapping of auxiliary job facts (container, backup name, size, ...).
pub type Details = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Restore,
    Delete,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "backup" => Some(Self::Backup),
            "restore" => Some(Self::Restore),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Whether the job rewrites the live data directory and therefore needs
    /// the companion container stopped around it.
    pub fn touches_data_dir(&self) -> bool {
        matches!(self, Self::Backup | Self::Restore)
    }

    pub fn needs_backup_name(&self) -> bool {
        matches!(self, Self::Restore | Self::Delete)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Running,
    Cancelling,
    Success,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

/// Immutable copy of the ledger, handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: Option<Uuid>,
    #[serde(rename = "type")]
    pub kind: Option<JobKind>,
    pub status: JobStatus,
    pub active: bool,
    pub message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub details: Details,
}

impl Default for JobView {
    fn default() -> Self {
        Self {
            id: None,
            kind: None,
            status: JobStatus::Idle,
            active: false,
            message: String::new(),
            started_at: None,
            ended_at: None,
            details: Details::new(),
        }
    }
}

/// A backup archive found in the backup directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub name: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

/// Answer returned to whoever asked for a job to start or stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub accepted: bool,
    pub message: String,
}

impl TriggerResponse {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
        }
    }
}
