//! Compliance Jobs
//!
//! Retention cleanup, periodic reporting and ledger maintenance, plus the
//! scheduler that runs them.

pub mod maintenance;
pub mod report;
pub mod retention;
pub mod scheduler;

pub use report::{ComplianceReport, ComplianceStatus};
pub use retention::{RetentionOutcome, RetentionSummary};
pub use scheduler::{ComplianceScheduler, Job, JobRun};
