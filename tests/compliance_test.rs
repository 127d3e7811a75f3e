//! Compliance jobs against a SQLite ledger

mod common;

use chrono::{Duration, SubsecRound, Utc};

use hospital_audit::audit::chain::checkpoint_hash;
use hospital_audit::audit::event::{actions, format_timestamp};
use hospital_audit::audit::{NewAuditEvent, Outcome, RiskLevel, GENESIS_HASH};
use hospital_audit::database::models::ChainCheckpoint;
use hospital_audit::compliance::{ComplianceScheduler, ComplianceStatus, JobRun, RetentionOutcome};
use hospital_audit::database::AuditStore;

use common::{actions_of, append_backdated, patient_view, setup_service};

const SEVEN_YEARS: i64 = 7 * 365;

#[tokio::test]
async fn test_retention_removes_expired_low_risk_entries_only() {
    let (db, service) = setup_service().await;
    let scheduler = ComplianceScheduler::new(service.clone(), service.config().compliance.clone());

    for i in 0..4 {
        append_backdated(db.as_ref(), patient_view("nurse-1", &format!("p-{}", i)), SEVEN_YEARS).await;
    }
    let deletion = append_backdated(
        db.as_ref(),
        NewAuditEvent::new("dr-1", "DOCTOR", "PATIENT_DELETE", "patient_data", Outcome::Success)
            .with_patient_id("p-9"),
        SEVEN_YEARS,
    )
    .await;
    assert_eq!(deletion.event.risk_level, RiskLevel::High);
    for i in 0..3 {
        append_backdated(db.as_ref(), patient_view("nurse-1", &format!("p-{}", i)), SEVEN_YEARS).await;
    }
    append_backdated(db.as_ref(), patient_view("nurse-1", "p-1"), 10).await;

    let summary = match scheduler.run_retention_now().await.unwrap() {
        JobRun::Completed(RetentionOutcome::Completed(summary)) => summary,
        other => panic!("unexpected retention result: {:?}", other),
    };
    assert_eq!(summary.deleted, 7);
    assert_eq!(summary.checkpoint_ids.len(), 2);

    let remaining = db.all_entries().await.unwrap();
    assert_eq!(remaining.len(), 2);
    assert_eq!(remaining[0].event.event_id, deletion.event.event_id);

    // Survivors plus the cleanup event itself still verify from genesis
    service.flush().await.unwrap();
    let result = service.verify_ledger().await.unwrap();
    assert!(result.is_valid, "{:?}", result.error_message);
    assert_eq!(result.bridged_gaps, 2);
    assert_eq!(
        actions_of(db.as_ref()).await.last().map(String::as_str),
        Some(actions::SYSTEM_RETENTION_CLEANUP)
    );
}

#[tokio::test]
async fn test_maintenance_failure_halts_retention_until_cleared() {
    let (db, service) = setup_service().await;
    let scheduler = ComplianceScheduler::new(service.clone(), service.config().compliance.clone());

    append_backdated(db.as_ref(), patient_view("nurse-1", "p-1"), SEVEN_YEARS).await;
    for i in 0..5 {
        service.record_event(patient_view("nurse-2", &format!("p-{}", i)));
    }
    service.flush().await.unwrap();

    sqlx::query("UPDATE audit_log SET patient_id = 'p-x' WHERE id = 4")
        .execute(db.pool())
        .await
        .unwrap();

    match scheduler.run_maintenance_now().await.unwrap() {
        JobRun::Completed(outcome) => {
            assert!(!outcome.result.is_valid);
            assert_eq!(outcome.result.first_invalid_id, Some(4));
        }
        JobRun::AlreadyRunning => panic!("maintenance should have run"),
    }
    assert!(db.active_integrity_hold().await.unwrap().is_some());

    let retention = scheduler.run_retention_now().await.unwrap();
    assert!(matches!(
        retention,
        JobRun::Completed(RetentionOutcome::Skipped { .. })
    ));
    assert_eq!(db.all_entries().await.unwrap().len(), 6);

    service.flush().await.unwrap();
    let recorded = actions_of(db.as_ref()).await;
    assert!(recorded.iter().any(|a| a == actions::AUDIT_INTEGRITY_VIOLATION));
    assert!(recorded.iter().any(|a| a == actions::SYSTEM_RETENTION_SKIPPED));

    assert_eq!(service.clear_integrity_hold("admin-1").await.unwrap(), 1);
    assert!(db.active_integrity_hold().await.unwrap().is_none());
}

#[tokio::test]
async fn test_weekly_report_status() {
    let (db, service) = setup_service().await;

    for i in 0..93 {
        service.record_patient_access("dr-1", "DOCTOR", &format!("p-{}", i % 15), "VIEW", Outcome::Success, None);
    }
    for _ in 0..7 {
        service.record_patient_access("dr-2", "DOCTOR", "p-1", "VIEW", Outcome::Failure, Some("consent missing"));
    }
    service.flush().await.unwrap();
    // Outside the window
    append_backdated(db.as_ref(), patient_view("nurse-1", "p-1"), 30).await;

    let end = Utc::now();
    let report = service
        .generate_compliance_report(end - Duration::days(7), end)
        .await
        .unwrap();

    assert_eq!(report.total_events, 100);
    assert_eq!(report.high_risk_events, 7);
    assert!((report.failure_rate - 0.07).abs() < 1e-9);
    assert_eq!(report.compliance_status, ComplianceStatus::MonitoringRequired);
    assert_eq!(report.unique_actors, 2);
    assert_eq!(report.patient_access_events, 100);
    assert_eq!(report.events_by_action["PATIENT_VIEW"], 100);
}

#[tokio::test]
async fn test_access_checks_follow_policy() {
    let (_db, service) = setup_service().await;

    assert!(service.check_access("DOCTOR", "medical_records"));
    assert!(service.check_access("NURSE", "patient_data"));
    assert!(!service.check_access("RECEPTIONIST", "medical_records"));
    assert!(!service.check_access("PATIENT", "billing"));
    assert!(service.check_access("ADMIN", "audit"));
    assert!(!service.check_access("UNKNOWN", "appointments"));
}

/// Remove entry 2 of a three-entry ledger and insert a correctly hashed
/// checkpoint whose ids could not have produced the gap
async fn forge_checkpoint(first: i64, last: i64, count: i64) -> hospital_audit::audit::VerificationResult {
    let (db, service) = setup_service().await;
    service.record_event(patient_view("nurse-1", "p-1"));
    service.record_event(
        NewAuditEvent::new("dr-1", "DOCTOR", "PATIENT_EXPORT", "patient_data", Outcome::Success)
            .with_patient_id("p-1"),
    );
    service.record_event(patient_view("nurse-1", "p-2"));
    service.flush().await.unwrap();

    let entries = db.all_entries().await.unwrap();
    let mut forged = ChainCheckpoint {
        id: 0,
        anchor_hash: entries[0].hash_chain.clone(),
        resume_hash: entries[2].previous_hash.clone(),
        deleted_count: count,
        first_deleted_id: first,
        last_deleted_id: last,
        created_at: Utc::now().trunc_subsecs(6),
        previous_checkpoint_hash: GENESIS_HASH.to_string(),
        checkpoint_hash: String::new(),
    };
    forged.checkpoint_hash = checkpoint_hash(GENESIS_HASH, &forged).unwrap();

    sqlx::query("DELETE FROM audit_log WHERE id = 2")
        .execute(db.pool())
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO audit_checkpoints (anchor_hash, resume_hash, deleted_count, first_deleted_id, \
         last_deleted_id, created_at, previous_checkpoint_hash, checkpoint_hash) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&forged.anchor_hash)
    .bind(&forged.resume_hash)
    .bind(forged.deleted_count)
    .bind(forged.first_deleted_id)
    .bind(forged.last_deleted_id)
    .bind(format_timestamp(&forged.created_at))
    .bind(&forged.previous_checkpoint_hash)
    .bind(&forged.checkpoint_hash)
    .execute(db.pool())
    .await
    .unwrap();

    service.verify_ledger().await.unwrap()
}

#[tokio::test]
async fn test_checkpoint_with_impossible_ids_does_not_hide_deletion() {
    let result = forge_checkpoint(500, 400, 999).await;
    assert!(!result.is_valid);
    assert_eq!(result.first_invalid_id, Some(3));
}

#[tokio::test]
async fn test_checkpoint_outside_gap_does_not_hide_deletion() {
    let result = forge_checkpoint(7, 9, 3).await;
    assert!(!result.is_valid);
    assert_eq!(result.first_invalid_id, Some(3));
}

#[tokio::test]
async fn test_unchained_checkpoint_rejected_by_sqlite_ledger() {
    let (db, service) = setup_service().await;
    for i in 0..3 {
        service.record_event(patient_view("nurse-1", &format!("p-{}", i)));
    }
    service.flush().await.unwrap();
    let entries = db.all_entries().await.unwrap();

    sqlx::query("DELETE FROM audit_log WHERE id = 2")
        .execute(db.pool())
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO audit_checkpoints (anchor_hash, resume_hash, deleted_count, first_deleted_id, \
         last_deleted_id, created_at, previous_checkpoint_hash, checkpoint_hash) \
         VALUES (?, ?, 1, 2, 2, ?, '0', 'sha256:forged')",
    )
    .bind(&entries[0].hash_chain)
    .bind(&entries[2].previous_hash)
    .bind(format_timestamp(&Utc::now()))
    .execute(db.pool())
    .await
    .unwrap();

    let result = service.verify_ledger().await.unwrap();
    assert!(!result.is_valid);
    assert!(result.invalid_checkpoint_id.is_some());
}

#[tokio::test]
async fn test_retention_runs_chain_checkpoints_in_sqlite() {
    let (db, service) = setup_service().await;
    let scheduler = ComplianceScheduler::new(service.clone(), service.config().compliance.clone());

    for i in 0..3 {
        append_backdated(db.as_ref(), patient_view("nurse-1", &format!("p-{}", i)), SEVEN_YEARS).await;
    }
    append_backdated(db.as_ref(), patient_view("nurse-1", "p-9"), 1).await;
    let first = match scheduler.run_retention_now().await.unwrap() {
        JobRun::Completed(RetentionOutcome::Completed(summary)) => summary,
        other => panic!("unexpected retention result: {:?}", other),
    };
    service.flush().await.unwrap();

    for i in 0..2 {
        append_backdated(db.as_ref(), patient_view("nurse-2", &format!("p-{}", i)), SEVEN_YEARS).await;
    }
    append_backdated(db.as_ref(), patient_view("nurse-2", "p-9"), 1).await;
    let second = match scheduler.run_retention_now().await.unwrap() {
        JobRun::Completed(RetentionOutcome::Completed(summary)) => summary,
        other => panic!("unexpected retention result: {:?}", other),
    };
    service.flush().await.unwrap();

    assert_eq!(first.deleted, 3);
    assert_eq!(second.deleted, 2);
    let checkpoints = db.checkpoints().await.unwrap();
    assert_eq!(checkpoints.len(), 2);
    assert_eq!(checkpoints[0].previous_checkpoint_hash, GENESIS_HASH);
    assert_eq!(checkpoints[1].previous_checkpoint_hash, checkpoints[0].checkpoint_hash);
    assert_eq!(second.checkpoint_head, checkpoints[1].checkpoint_hash);

    let result = service.verify_ledger().await.unwrap();
    assert!(result.is_valid, "{:?}", result.error_message);
    assert_eq!(result.bridged_gaps, 2);

    // Dropping the newest checkpoint breaks the head sealed into the ledger
    sqlx::query("DELETE FROM audit_checkpoints WHERE id = ?")
        .bind(checkpoints[1].id)
        .execute(db.pool())
        .await
        .unwrap();
    assert!(!service.verify_ledger().await.unwrap().is_valid);
}
