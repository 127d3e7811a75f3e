//! Compliance Report
//!
//! Read-only aggregation of the ledger over a date range.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::audit::event::{actions, resources, AuditLogEntry, Outcome, RiskLevel};
use crate::database::AuditStore;
use crate::error::{AuditError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceStatus {
    Compliant,
    MonitoringRequired,
    NeedsAttention,
}

impl ComplianceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceStatus::Compliant => "COMPLIANT",
            ComplianceStatus::MonitoringRequired => "MONITORING_REQUIRED",
            ComplianceStatus::NeedsAttention => "NEEDS_ATTENTION",
        }
    }

    pub fn evaluate(high_risk_events: u64, failure_rate: f64) -> Self {
        if high_risk_events > 10 || failure_rate > 0.10 {
            ComplianceStatus::NeedsAttention
        } else if high_risk_events > 5 || failure_rate > 0.05 {
            ComplianceStatus::MonitoringRequired
        } else {
            ComplianceStatus::Compliant
        }
    }
}

impl std::fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const SUSPICIOUS_ACTIONS: &[&str] = &[
    actions::SUSPICIOUS_LOGIN_ATTEMPTS,
    actions::UNUSUAL_PATIENT_ACCESS_PATTERN,
    actions::MULTIPLE_IP_ACCESS,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub total_events: u64,
    pub events_by_action: BTreeMap<String, u64>,
    pub events_by_risk: BTreeMap<RiskLevel, u64>,
    pub events_by_outcome: BTreeMap<String, u64>,
    pub high_risk_events: u64,
    pub failure_rate: f64,
    pub unique_actors: u64,
    pub patient_access_events: u64,
    pub suspicious_activity_events: u64,
    pub integrity_violations: u64,
    pub compliance_status: ComplianceStatus,
    pub recommendations: Vec<String>,
}

impl ComplianceReport {
    /// Aggregate entries already restricted to `[start, end]`
    pub fn from_entries(entries: &[AuditLogEntry], start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let mut events_by_action = BTreeMap::new();
        let mut events_by_risk = BTreeMap::new();
        let mut events_by_outcome = BTreeMap::new();
        let mut actors = HashSet::new();
        let mut failures = 0u64;
        let mut patient_access_events = 0u64;
        let mut suspicious_activity_events = 0u64;
        let mut integrity_violations = 0u64;

        for entry in entries {
            let event = &entry.event;
            *events_by_action.entry(event.action.clone()).or_insert(0) += 1;
            *events_by_risk.entry(event.risk_level).or_insert(0) += 1;
            *events_by_outcome.entry(event.outcome.as_str().to_string()).or_insert(0) += 1;
            actors.insert(event.actor_id.as_str());

            if event.outcome == Outcome::Failure {
                failures += 1;
            }
            if event.resource == resources::PATIENT_DATA || event.resource == resources::MEDICAL_RECORDS {
                patient_access_events += 1;
            }
            if SUSPICIOUS_ACTIONS.contains(&event.action.as_str()) {
                suspicious_activity_events += 1;
            }
            if event.action == actions::AUDIT_INTEGRITY_VIOLATION {
                integrity_violations += 1;
            }
        }

        let total_events = entries.len() as u64;
        let high_risk_events = events_by_risk.get(&RiskLevel::High).copied().unwrap_or(0)
            + events_by_risk.get(&RiskLevel::Critical).copied().unwrap_or(0);
        let failure_rate = if total_events == 0 {
            0.0
        } else {
            failures as f64 / total_events as f64
        };
        let compliance_status = ComplianceStatus::evaluate(high_risk_events, failure_rate);

        let mut recommendations = Vec::new();
        if failure_rate > 0.05 {
            recommendations.push(format!(
                "Failure rate is {:.1}%: review failed authentication and authorization attempts",
                failure_rate * 100.0
            ));
        }
        if high_risk_events > 5 {
            recommendations.push(format!(
                "{} high-risk events recorded: confirm each deletion, export and failure was authorized",
                high_risk_events
            ));
        }
        if suspicious_activity_events > 0 {
            recommendations.push(format!(
                "Investigate {} suspicious activity alerts",
                suspicious_activity_events
            ));
        }
        if integrity_violations > 0 {
            recommendations.push(
                "Ledger integrity violation recorded: automated retention is halted until the hold is cleared"
                    .to_string(),
            );
        }

        Self {
            start,
            end,
            generated_at: Utc::now(),
            total_events,
            events_by_action,
            events_by_risk,
            events_by_outcome,
            high_risk_events,
            failure_rate,
            unique_actors: actors.len() as u64,
            patient_access_events,
            suspicious_activity_events,
            integrity_violations,
            compliance_status,
            recommendations,
        }
    }
}

/// Scan the ledger for `[start, end]` and aggregate it
pub async fn generate_report(
    store: &dyn AuditStore,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<ComplianceReport> {
    if start > end {
        return Err(AuditError::ValidationError(format!(
            "report start {} is after end {}",
            start, end
        )));
    }
    let entries = store.entries_in_range(start, end).await?;
    Ok(ComplianceReport::from_entries(&entries, start, end))
}

const MAX_NAME_ATTEMPTS: u32 = 100;

/// Write the report as pretty JSON into `dir`, returning the file path.
///
/// Existing reports are never overwritten; a name collision gets a
/// numeric suffix.
pub async fn write_report(dir: &Path, report: &ComplianceReport) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        AuditError::JobError(format!("Failed to create reports directory {}: {}", dir.display(), e))
    })?;

    let json = serde_json::to_string_pretty(report)?;
    let stem = format!(
        "compliance-report-{}",
        report.generated_at.format("%Y%m%dT%H%M%S%.6fZ")
    );

    let mut attempt = 0u32;
    loop {
        let name = match attempt {
            0 => format!("{}.json", stem),
            n => format!("{}-{}.json", stem, n),
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(mut file) => {
                file.write_all(json.as_bytes()).await.map_err(|e| {
                    AuditError::JobError(format!("Failed to write report {}: {}", path.display(), e))
                })?;
                file.flush().await.map_err(|e| {
                    AuditError::JobError(format!("Failed to write report {}: {}", path.display(), e))
                })?;
                info!("Compliance report written to {}", path.display());
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS => {
                attempt += 1;
            }
            Err(e) => {
                return Err(AuditError::JobError(format!(
                    "Failed to create report {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
}
