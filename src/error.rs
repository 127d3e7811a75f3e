use thiserror::Error;

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for AuditError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError(format!("Database error: {}", err))
    }
}

impl From<config::ConfigError> for AuditError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Audit integrity violation: {0}")]
    IntegrityError(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Scheduled job error: {0}")]
    JobError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, AuditError>;

impl AuditError {
    pub fn access_denied(role: &str, resource: &str) -> Self {
        Self::AccessDenied(format!(
            "role {} may not access resource category {}",
            role, resource
        ))
    }

    pub fn job_timeout(job: &str, secs: u64) -> Self {
        Self::JobError(format!("{} exceeded its {}s execution timeout", job, secs))
    }

    /// Whether this error is a persistence-side failure that the drain worker retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DatabaseError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AuditError::access_denied("RECEPTIONIST", "medical_records");
        assert_eq!(
            err.to_string(),
            "Access denied: role RECEPTIONIST may not access resource category medical_records"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AuditError::DatabaseError("locked".to_string()).is_retryable());
        assert!(!AuditError::IntegrityError("hash mismatch".to_string()).is_retryable());
    }
}
