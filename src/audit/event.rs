//! Audit Event
//!
//! Defines the audit record submitted by collaborators, the persisted
//! ledger row, and the canonical serialization the hash chain is built on.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::audit::risk::classify_risk;
use crate::error::AuditError;

/// Sentinel used when an IP address or user agent is unavailable
pub const UNKNOWN: &str = "unknown";

pub mod actors {
    pub const ANONYMOUS: &str = "anonymous";
    pub const SYSTEM: &str = "system";
}

pub mod roles {
    pub const ADMIN: &str = "ADMIN";
    pub const DOCTOR: &str = "DOCTOR";
    pub const NURSE: &str = "NURSE";
    pub const RECEPTIONIST: &str = "RECEPTIONIST";
    pub const BILLING: &str = "BILLING";
    pub const PATIENT: &str = "PATIENT";
    pub const UNKNOWN: &str = "UNKNOWN";
    pub const SYSTEM: &str = "SYSTEM";
}

pub mod resources {
    pub const PATIENT_DATA: &str = "patient_data";
    pub const MEDICAL_RECORDS: &str = "medical_records";
    pub const APPOINTMENTS: &str = "appointments";
    pub const BILLING: &str = "billing";
    pub const AUTHENTICATION: &str = "authentication";
    pub const USER_MANAGEMENT: &str = "user_management";
    pub const SYSTEM: &str = "system";
    pub const AUDIT: &str = "audit";
}

pub mod actions {
    pub const AUTH_LOGIN: &str = "AUTH_LOGIN";
    pub const AUTH_LOGOUT: &str = "AUTH_LOGOUT";
    pub const AUTH_FAILED_LOGIN: &str = "AUTH_FAILED_LOGIN";
    pub const ACCESS_DENIED: &str = "ACCESS_DENIED";
    pub const SUSPICIOUS_LOGIN_ATTEMPTS: &str = "SUSPICIOUS_LOGIN_ATTEMPTS";
    pub const UNUSUAL_PATIENT_ACCESS_PATTERN: &str = "UNUSUAL_PATIENT_ACCESS_PATTERN";
    pub const MULTIPLE_IP_ACCESS: &str = "MULTIPLE_IP_ACCESS";
    pub const AUDIT_INTEGRITY_VIOLATION: &str = "AUDIT_INTEGRITY_VIOLATION";
    pub const SYSTEM_RATE_LIMIT_EXCEEDED: &str = "SYSTEM_RATE_LIMIT_EXCEEDED";
    pub const SYSTEM_AUDIT_PERSISTENCE_RECOVERED: &str = "SYSTEM_AUDIT_PERSISTENCE_RECOVERED";
    pub const SYSTEM_AUDIT_EVENTS_DROPPED: &str = "SYSTEM_AUDIT_EVENTS_DROPPED";
    pub const SYSTEM_RETENTION_CLEANUP: &str = "SYSTEM_RETENTION_CLEANUP";
    pub const SYSTEM_RETENTION_SKIPPED: &str = "SYSTEM_RETENTION_SKIPPED";
    pub const SYSTEM_RETENTION_FAILED: &str = "SYSTEM_RETENTION_FAILED";
    pub const SYSTEM_COMPLIANCE_REPORT_GENERATED: &str = "SYSTEM_COMPLIANCE_REPORT_GENERATED";
    pub const SYSTEM_COMPLIANCE_REPORT_FAILED: &str = "SYSTEM_COMPLIANCE_REPORT_FAILED";
    pub const SYSTEM_LEDGER_VERIFIED: &str = "SYSTEM_LEDGER_VERIFIED";
    pub const SYSTEM_LEDGER_MAINTENANCE_FAILED: &str = "SYSTEM_LEDGER_MAINTENANCE_FAILED";
    pub const SYSTEM_INTEGRITY_HOLD_CLEARED: &str = "SYSTEM_INTEGRITY_HOLD_CLEARED";

    const ALERTS: &[&str] = &[
        SUSPICIOUS_LOGIN_ATTEMPTS,
        UNUSUAL_PATIENT_ACCESS_PATTERN,
        MULTIPLE_IP_ACCESS,
        AUDIT_INTEGRITY_VIOLATION,
    ];

    /// Actions only the audit subsystem itself emits
    pub fn is_reserved(action: &str) -> bool {
        action.starts_with("SYSTEM_") || ALERTS.contains(&action)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Failure,
    Warning,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failure => "FAILURE",
            Outcome::Warning => "WARNING",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Outcome {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Outcome::Success),
            "FAILURE" => Ok(Outcome::Failure),
            "WARNING" => Ok(Outcome::Warning),
            _ => Err(AuditError::ValidationError(format!("Invalid outcome: {}", s))),
        }
    }
}

/// Ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    /// HIGH and CRITICAL events trigger an immediate drain and are exempt from retention
    pub fn is_escalated(&self) -> bool {
        *self >= RiskLevel::High
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(RiskLevel::Low),
            "MEDIUM" => Ok(RiskLevel::Medium),
            "HIGH" => Ok(RiskLevel::High),
            "CRITICAL" => Ok(RiskLevel::Critical),
            _ => Err(AuditError::ValidationError(format!("Invalid risk level: {}", s))),
        }
    }
}

/// An event as submitted by a collaborator. Risk, timestamp and identifier
/// are assigned when it is accepted into the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAuditEvent {
    pub actor_id: String,
    pub actor_role: String,
    pub action: String,
    pub resource: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub outcome: Outcome,
    #[serde(default)]
    pub reason: Option<String>,
}

impl NewAuditEvent {
    pub fn new(
        actor_id: impl Into<String>,
        actor_role: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            actor_role: actor_role.into(),
            action: action.into(),
            resource: resource.into(),
            resource_id: None,
            patient_id: None,
            details: None,
            ip_address: None,
            user_agent: None,
            outcome,
            reason: None,
        }
    }

    /// Event attributed to the audit subsystem itself
    pub fn system(action: impl Into<String>, outcome: Outcome) -> Self {
        Self::new(actors::SYSTEM, roles::SYSTEM, action, resources::SYSTEM, outcome)
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_patient_id(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_origin(mut self, ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// An accepted audit event awaiting persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub actor_id: String,
    pub actor_role: String,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub patient_id: Option<String>,
    pub details: Option<Value>,
    pub ip_address: String,
    pub user_agent: String,
    pub outcome: Outcome,
    pub risk_level: RiskLevel,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Field order here is the canonical order; do not reorder.
#[derive(Serialize)]
struct CanonicalEvent<'a> {
    event_id: String,
    actor_id: &'a str,
    actor_role: &'a str,
    action: &'a str,
    resource: &'a str,
    resource_id: Option<&'a str>,
    patient_id: Option<&'a str>,
    details: Option<Value>,
    ip_address: &'a str,
    user_agent: &'a str,
    outcome: &'static str,
    risk_level: &'static str,
    reason: Option<&'a str>,
    timestamp: String,
}

impl AuditEvent {
    /// Accept a submitted event: derive risk, redact details, stamp time and id
    pub fn accept(new: NewAuditEvent) -> Self {
        Self::accept_at(new, Utc::now())
    }

    pub fn accept_at(new: NewAuditEvent, at: DateTime<Utc>) -> Self {
        let actor_id = non_empty_or(new.actor_id, actors::ANONYMOUS);
        let actor_role = non_empty_or(new.actor_role, roles::UNKNOWN);
        let risk_level = classify_risk(&new.action, new.outcome, &actor_role);

        Self {
            event_id: Uuid::new_v4(),
            actor_id,
            actor_role,
            action: new.action,
            resource: new.resource,
            resource_id: new.resource_id,
            patient_id: new.patient_id,
            details: new.details.map(redact_details),
            ip_address: non_empty_or(new.ip_address.unwrap_or_default(), UNKNOWN),
            user_agent: non_empty_or(new.user_agent.unwrap_or_default(), UNKNOWN),
            outcome: new.outcome,
            risk_level,
            reason: new.reason,
            timestamp: at.trunc_subsecs(6),
        }
    }

    /// Whitespace-stable serialization of every field, used as hash input
    pub fn canonical_string(&self) -> Result<String, AuditError> {
        let canonical = CanonicalEvent {
            event_id: self.event_id.to_string(),
            actor_id: &self.actor_id,
            actor_role: &self.actor_role,
            action: &self.action,
            resource: &self.resource,
            resource_id: self.resource_id.as_deref(),
            patient_id: self.patient_id.as_deref(),
            details: self.details.clone().map(sort_keys),
            ip_address: &self.ip_address,
            user_agent: &self.user_agent,
            outcome: self.outcome.as_str(),
            risk_level: self.risk_level.as_str(),
            reason: self.reason.as_deref(),
            timestamp: format_timestamp(&self.timestamp),
        };
        Ok(serde_json::to_string(&canonical)?)
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "{} {} by {} ({}) -> {} [{}]",
            self.action, self.resource, self.actor_id, self.actor_role, self.outcome, self.risk_level
        )
    }
}

/// A persisted ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    #[serde(flatten)]
    pub event: AuditEvent,
    pub previous_hash: String,
    pub hash_chain: String,
    pub created_at: DateTime<Utc>,
}

/// RFC 3339 with microseconds; the stored and hashed representation
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, AuditError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AuditError::SerializationError(format!("Invalid timestamp {}: {}", value, e)))
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

/// Rebuild objects with keys in lexical order, independent of the map backing
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

const REDACTED: &str = "[REDACTED]";
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "token",
    "secret",
    "authorization",
    "cookie",
    "ssn",
    "api_key",
];

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| key.contains(s))
}

/// Replace credential-like values anywhere in the payload
pub fn redact_details(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    if is_sensitive_key(&k) {
                        (k, Value::String(REDACTED.to_string()))
                    } else {
                        (k, redact_details(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact_details).collect()),
        other => other,
    }
}
