//! Risk Classification
//!
//! The single rule table that assigns a risk level to every audit event.
//! Rules are evaluated in order and the first match wins.

use crate::audit::event::{actions, roles, Outcome, RiskLevel};

/// Alert actions raised by the ledger itself carry a fixed level
const FIXED_LEVELS: &[(&str, RiskLevel)] = &[
    (actions::SUSPICIOUS_LOGIN_ATTEMPTS, RiskLevel::Critical),
    (actions::AUDIT_INTEGRITY_VIOLATION, RiskLevel::Critical),
    (actions::UNUSUAL_PATIENT_ACCESS_PATTERN, RiskLevel::High),
    (actions::MULTIPLE_IP_ACCESS, RiskLevel::High),
];

/// Classify an event. Pure and total: unknown input falls through to LOW.
pub fn classify_risk(action: &str, outcome: Outcome, actor_role: &str) -> RiskLevel {
    if let Some((_, level)) = FIXED_LEVELS.iter().find(|(a, _)| *a == action) {
        return *level;
    }

    if outcome == Outcome::Failure {
        return RiskLevel::High;
    }

    if action.contains("DELETE") || action.contains("EXPORT") {
        return RiskLevel::High;
    }

    if action.contains("UPDATE") || action.contains("CREATE") {
        return RiskLevel::Medium;
    }

    if actor_role == roles::ADMIN || actor_role == roles::SYSTEM {
        return RiskLevel::Medium;
    }

    RiskLevel::Low
}
