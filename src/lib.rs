pub mod access;
pub mod api;
pub mod audit;
pub mod compliance;
pub mod config;
pub mod database;
pub mod error;
pub mod service;

pub use error::AuditError;
pub use service::{AuditService, BackgroundTasks, RequestContext};
