//! Application configuration
//!
//! Settings are layered: built-in defaults, then an optional
//! `hospital-audit.toml` file, then `HOSPITAL_AUDIT__*` environment variables
//! (e.g. `HOSPITAL_AUDIT__AUDIT__BATCH_SIZE=100`).

pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

pub const DEFAULT_CONFIG_FILE: &str = "hospital-audit";
pub const ENV_PREFIX: &str = "HOSPITAL_AUDIT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub audit: AuditConfig,
    pub detection: DetectionConfig,
    pub compliance: ComplianceConfig,
    /// Optional YAML file overriding the built-in access policy
    pub access_policy_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://hospital-audit.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub flush_interval_secs: u64,
    pub batch_size: usize,
    pub queue_capacity: usize,
    /// Consecutive failed drains before a standing alert is raised
    pub max_consecutive_failures: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 5,
            batch_size: 50,
            queue_capacity: 10_000,
            max_consecutive_failures: 10,
        }
    }
}

impl AuditConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub window_minutes: i64,
    pub failed_login_threshold: usize,
    pub patient_access_threshold: usize,
    pub distinct_ip_threshold: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            window_minutes: 60,
            failed_login_threshold: 5,
            patient_access_threshold: 20,
            distinct_ip_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    pub enabled: bool,
    pub retention_interval_hours: u64,
    pub report_interval_hours: u64,
    pub maintenance_interval_hours: u64,
    /// Legal retention horizon for LOW/MEDIUM entries
    pub retention_days: i64,
    pub report_window_days: i64,
    pub maintenance_window_days: i64,
    pub job_timeout_secs: u64,
    pub reports_dir: Option<String>,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_interval_hours: 24,
            report_interval_hours: 24 * 7,
            maintenance_interval_hours: 24 * 30,
            retention_days: 6 * 365,
            report_window_days: 7,
            maintenance_window_days: 31,
            job_timeout_secs: 300,
            reports_dir: None,
        }
    }
}

impl ComplianceConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h.max(1) * 3600)
}

impl ComplianceConfig {
    pub fn retention_interval(&self) -> Duration {
        hours(self.retention_interval_hours)
    }

    pub fn report_interval(&self) -> Duration {
        hours(self.report_interval_hours)
    }

    pub fn maintenance_interval(&self) -> Duration {
        hours(self.maintenance_interval_hours)
    }
}

impl AppConfig {
    /// Load from `hospital-audit.toml` (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    pub fn load_from(file: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        use crate::error::AuditError;

        if self.audit.batch_size == 0 {
            return Err(AuditError::ConfigError(
                "audit.batch_size must be at least 1".to_string(),
            ));
        }
        if self.audit.queue_capacity < self.audit.batch_size {
            return Err(AuditError::ConfigError(format!(
                "audit.queue_capacity ({}) must not be smaller than audit.batch_size ({})",
                self.audit.queue_capacity, self.audit.batch_size
            )));
        }
        if self.detection.window_minutes <= 0 {
            return Err(AuditError::ConfigError(
                "detection.window_minutes must be positive".to_string(),
            ));
        }
        if self.compliance.retention_days <= 0 {
            return Err(AuditError::ConfigError(
                "compliance.retention_days must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
