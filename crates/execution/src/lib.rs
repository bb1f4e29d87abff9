//! Job execution: backends, per-job supervision and the lifecycle manager.

pub mod audit;
pub mod backends;
pub mod collector;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod runner;
pub mod settings;
mod supervisor;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use audit::{AuditEntry, AuditEvent, AuditLog};
pub use backends::{BackendHandle, ExecutionBackend, JobLogs};
pub use error::ExecutionError;
pub use lifecycle::{BatchRequest, BatchSubmission, JobManager};
pub use runner::{CommandRunner, ProcessRunner};
pub use settings::{BackendSelection, ExecutionSettings, HpcSettings};
pub use supervisor::{EXTERNAL_CANCEL_REASON, USER_CANCEL_REASON};
