#![allow(dead_code)]

use chrono::{Duration, Utc};
use std::sync::Arc;

use hospital_audit::access::AccessPolicy;
use hospital_audit::audit::{next_hash, AuditEvent, AuditLogEntry, NewAuditEvent, Outcome, GENESIS_HASH};
use hospital_audit::config::AppConfig;
use hospital_audit::database::{AuditStore, Database};
use hospital_audit::AuditService;

/// Setup an in-memory SQLite ledger for testing
pub async fn setup_test_db() -> Arc<Database> {
    Arc::new(
        Database::new_in_memory()
            .await
            .expect("Failed to create test database"),
    )
}

/// Service over a fresh in-memory ledger with default settings
pub async fn setup_service() -> (Arc<Database>, AuditService) {
    let db = setup_test_db().await;
    let service = AuditService::new(db.clone(), &AppConfig::default(), AccessPolicy::default());
    (db, service)
}

/// Append an event dated `days_ago` directly to the ledger, bypassing the queue
pub async fn append_backdated(store: &dyn AuditStore, event: NewAuditEvent, days_ago: i64) -> AuditLogEntry {
    let event = AuditEvent::accept_at(event, Utc::now() - Duration::days(days_ago));
    let previous = store
        .last_hash()
        .await
        .expect("Failed to read ledger head")
        .unwrap_or_else(|| GENESIS_HASH.to_string());
    let hash = next_hash(&previous, &event).expect("Failed to hash event");
    store
        .insert_entry(&event, &previous, &hash)
        .await
        .expect("Failed to insert entry")
}

pub fn patient_view(actor: &str, patient: &str) -> NewAuditEvent {
    NewAuditEvent::new(actor, "NURSE", "PATIENT_VIEW", "patient_data", Outcome::Success)
        .with_patient_id(patient)
        .with_origin("10.0.0.5", "ehr-client/2.1")
}

pub async fn actions_of(store: &dyn AuditStore) -> Vec<String> {
    store
        .all_entries()
        .await
        .expect("Failed to read ledger")
        .into_iter()
        .map(|e| e.event.action)
        .collect()
}
