pub mod archive;
pub mod container;
pub mod controller;
pub mod error;
pub mod ledger;
pub mod models;
pub mod naming;
pub mod path_guard;
pub mod rename_aside;
pub mod retention;
pub mod runner;

pub use container::{ContainerControl, ContainerGuard, ContainerSummary};
pub use controller::JobController;
pub use error::JobError;
pub use ledger::{JobLedger, JobTicket};
pub use models::{BackupEntry, Details, JobKind, JobStatus, JobView, TriggerResponse};
pub use naming::BackupNaming;
pub use path_guard::PathGuard;
pub use runner::{JobRequest, JobRunner};
