//! Retention Cleanup
//!
//! Deletes LOW and MEDIUM entries older than the retention horizon. Every
//! deleted run of consecutive entries is first recorded as a checkpoint so
//! the surviving ledger still verifies end to end.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::audit::chain::{checkpoint_hash, GENESIS_HASH};
use crate::audit::verify::{verify_checkpoint_chain, Bridges};
use crate::database::models::{ChainCheckpoint, ChainLink};
use crate::database::AuditStore;
use crate::error::{AuditError, Result};

const PAGE_SIZE: i64 = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionSummary {
    pub cutoff: DateTime<Utc>,
    pub deleted: u64,
    pub checkpoint_ids: Vec<i64>,
    /// Head of the checkpoint chain after this run
    pub checkpoint_head: String,
    /// Eligible entries kept because nothing has been persisted after them yet
    pub deferred: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetentionOutcome {
    Completed(RetentionSummary),
    /// An integrity hold is active; nothing was touched
    Skipped { reason: String },
}

fn eligible(link: &ChainLink, cutoff: DateTime<Utc>) -> bool {
    link.timestamp < cutoff && !link.risk_level.is_escalated()
}

/// Last surviving entry before the run being collected (id 0 is genesis)
struct Anchor {
    id: i64,
    hash: String,
}

/// Remove expired entries as of `now`.
///
/// Each run of consecutive expired entries is deleted together with its
/// checkpoint in one store operation, so an interrupted cleanup leaves the
/// ledger as it was. Runs whose internal linkage does not check out are never
/// deleted: an integrity hold is raised instead and `IntegrityError` returned.
pub async fn run_retention(
    store: &dyn AuditStore,
    retention_days: i64,
    now: DateTime<Utc>,
) -> Result<RetentionOutcome> {
    if let Some(hold) = store.active_integrity_hold().await? {
        warn!("Retention cleanup skipped, integrity hold active: {}", hold.reason);
        return Ok(RetentionOutcome::Skipped { reason: hold.reason });
    }

    let existing = store.checkpoints().await?;
    if let Err((_, message)) = verify_checkpoint_chain(&existing) {
        return Err(raise_hold(store, message).await?);
    }

    let cutoff = now - Duration::days(retention_days);
    let mut summary = RetentionSummary {
        cutoff,
        deleted: 0,
        checkpoint_ids: Vec::new(),
        checkpoint_head: existing
            .last()
            .map(|c| c.checkpoint_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string()),
        deferred: 0,
    };

    let max_expired = match store.max_expired_id(cutoff).await? {
        Some(id) => id,
        None => {
            debug!("No audit entries older than {}", cutoff);
            return Ok(RetentionOutcome::Completed(summary));
        }
    };

    let bridges = Bridges::new(&existing);
    let mut anchor = Anchor {
        id: 0,
        hash: GENESIS_HASH.to_string(),
    };
    let mut run: Vec<ChainLink> = Vec::new();
    let mut after_id = 0;

    'pages: loop {
        let page = store.chain_links(after_id, PAGE_SIZE).await?;
        if page.is_empty() {
            break;
        }

        for link in page {
            after_id = link.id;
            if link.id <= max_expired && eligible(&link, cutoff) {
                run.push(link);
                continue;
            }

            if !run.is_empty() {
                let run_links = std::mem::take(&mut run);
                delete_run(store, &anchor, &link, run_links, &bridges, cutoff, &mut summary).await?;
            }
            anchor = Anchor {
                id: link.id,
                hash: link.hash_chain.clone(),
            };

            if link.id > max_expired {
                break 'pages;
            }
        }
    }

    if !run.is_empty() {
        debug!(
            "Deferring {} expired entries at the head of the ledger",
            run.len()
        );
        summary.deferred = run.len() as u64;
    }

    info!(
        "Retention cleanup removed {} entries older than {} ({} checkpoints)",
        summary.deleted,
        cutoff,
        summary.checkpoint_ids.len()
    );
    Ok(RetentionOutcome::Completed(summary))
}

async fn raise_hold(store: &dyn AuditStore, message: String) -> Result<AuditError> {
    error!("Retention aborted: {}", message);
    store.set_integrity_hold(&message).await?;
    Ok(AuditError::IntegrityError(message))
}

async fn delete_run(
    store: &dyn AuditStore,
    anchor: &Anchor,
    survivor: &ChainLink,
    run: Vec<ChainLink>,
    bridges: &Bridges<'_>,
    cutoff: DateTime<Utc>,
    summary: &mut RetentionSummary,
) -> Result<()> {
    if let Err(message) = check_run_linkage(anchor, survivor, &run, bridges) {
        return Err(raise_hold(store, message).await?);
    }

    let (first, last) = match (run.first(), run.last()) {
        (Some(first), Some(last)) => (first.id, last.id),
        _ => return Ok(()),
    };

    let mut checkpoint = ChainCheckpoint {
        id: 0,
        anchor_hash: anchor.hash.clone(),
        resume_hash: survivor.previous_hash.clone(),
        deleted_count: run.len() as i64,
        first_deleted_id: first,
        last_deleted_id: last,
        created_at: Utc::now().trunc_subsecs(6),
        previous_checkpoint_hash: summary.checkpoint_head.clone(),
        checkpoint_hash: String::new(),
    };
    checkpoint.checkpoint_hash = checkpoint_hash(&checkpoint.previous_checkpoint_hash, &checkpoint)?;

    let ids: Vec<i64> = run.iter().map(|l| l.id).collect();
    let checkpoint_id = store.delete_run_with_checkpoint(&checkpoint, &ids, cutoff).await?;
    debug!(
        "Removed entries {}..{} behind checkpoint {}",
        first, last, checkpoint_id
    );

    summary.deleted += ids.len() as u64;
    summary.checkpoint_ids.push(checkpoint_id);
    summary.checkpoint_head = checkpoint.checkpoint_hash;
    Ok(())
}

/// Refuse to bridge over entries that were not a contiguous chain to begin with
fn check_run_linkage(
    anchor: &Anchor,
    survivor: &ChainLink,
    run: &[ChainLink],
    bridges: &Bridges<'_>,
) -> std::result::Result<(), String> {
    let mut expected_id = anchor.id;
    let mut expected = anchor.hash.as_str();
    for link in run.iter().chain(std::iter::once(survivor)) {
        let linked = link.previous_hash == expected
            || bridges.covers(expected_id, expected, link.id, &link.previous_hash);
        if !linked {
            return Err(format!(
                "entry {} does not follow its predecessor (expected previous {}, found {})",
                link.id, expected, link.previous_hash
            ));
        }
        expected_id = link.id;
        expected = link.hash_chain.as_str();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::chain::next_hash;
    use crate::audit::event::{AuditEvent, NewAuditEvent, Outcome};
    use crate::audit::verify::verify_chain;
    use crate::database::MemoryStore;

    const SEVEN_YEARS: i64 = 7 * 365;

    async fn append(store: &MemoryStore, action: &str, outcome: Outcome, days_ago: i64) {
        let at = Utc::now() - Duration::days(days_ago);
        let event = AuditEvent::accept_at(
            NewAuditEvent::new("u1", "NURSE", action, "patient_data", outcome),
            at,
        );
        let previous = store.last_hash().await.unwrap().unwrap_or_else(|| GENESIS_HASH.to_string());
        let hash = next_hash(&previous, &event).unwrap();
        store.insert_entry(&event, &previous, &hash).await.unwrap();
    }

    async fn assert_verifies(store: &MemoryStore) {
        let entries = store.all_entries().await.unwrap();
        let checkpoints = store.checkpoints().await.unwrap();
        let result = verify_chain(&entries, &checkpoints, true);
        assert!(result.is_valid, "{:?}", result.error_message);
    }

    fn completed(outcome: RetentionOutcome) -> RetentionSummary {
        match outcome {
            RetentionOutcome::Completed(summary) => summary,
            other => panic!("expected completed retention, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deletes_expired_low_risk_and_keeps_high() {
        let store = MemoryStore::new();
        append(&store, "PATIENT_VIEW", Outcome::Success, SEVEN_YEARS).await;
        append(&store, "PATIENT_VIEW", Outcome::Success, SEVEN_YEARS).await;
        append(&store, "PATIENT_DELETE", Outcome::Success, SEVEN_YEARS).await;
        append(&store, "PATIENT_UPDATE", Outcome::Success, SEVEN_YEARS).await;
        append(&store, "PATIENT_VIEW", Outcome::Success, 1).await;

        let summary = completed(run_retention(&store, 2190, Utc::now()).await.unwrap());
        assert_eq!(summary.deleted, 3);
        assert_eq!(summary.checkpoint_ids.len(), 2);

        let remaining = store.all_entries().await.unwrap();
        let actions: Vec<_> = remaining.iter().map(|e| e.event.action.as_str()).collect();
        assert_eq!(actions, vec!["PATIENT_DELETE", "PATIENT_VIEW"]);
        assert_verifies(&store).await;
    }

    #[tokio::test]
    async fn test_repeated_cleanup_keeps_ledger_verifiable() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            append(&store, "PATIENT_VIEW", Outcome::Success, SEVEN_YEARS).await;
        }
        append(&store, "PATIENT_VIEW", Outcome::Success, 2000).await;
        append(&store, "PATIENT_VIEW", Outcome::Success, 1).await;

        let first = completed(run_retention(&store, 2190, Utc::now()).await.unwrap());
        assert_eq!(first.deleted, 3);
        assert_verifies(&store).await;

        // A year later the 2000-day-old entry has expired too
        let later = Utc::now() + Duration::days(365);
        let second = completed(run_retention(&store, 2190, later).await.unwrap());
        assert_eq!(second.deleted, 1);
        assert_eq!(store.len(), 1);
        assert_verifies(&store).await;
    }

    #[tokio::test]
    async fn test_expired_head_is_deferred() {
        let store = MemoryStore::new();
        append(&store, "PATIENT_VIEW", Outcome::Success, SEVEN_YEARS).await;

        let summary = completed(run_retention(&store, 2190, Utc::now()).await.unwrap());
        assert_eq!(summary.deleted, 0);
        assert_eq!(summary.deferred, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_hold_skips_cleanup() {
        let store = MemoryStore::new();
        append(&store, "PATIENT_VIEW", Outcome::Success, SEVEN_YEARS).await;
        append(&store, "PATIENT_VIEW", Outcome::Success, 1).await;
        store.set_integrity_hold("hash mismatch").await.unwrap();

        let outcome = run_retention(&store, 2190, Utc::now()).await.unwrap();
        assert_eq!(
            outcome,
            RetentionOutcome::Skipped {
                reason: "hash mismatch".to_string()
            }
        );
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_broken_linkage_aborts() {
        let store = MemoryStore::new();
        append(&store, "PATIENT_VIEW", Outcome::Success, SEVEN_YEARS).await;
        append(&store, "PATIENT_VIEW", Outcome::Success, SEVEN_YEARS).await;
        append(&store, "PATIENT_VIEW", Outcome::Success, 1).await;
        store.tamper(2, |e| e.previous_hash = "sha256:forged".to_string());

        let err = run_retention(&store, 2190, Utc::now()).await.unwrap_err();
        assert!(matches!(err, AuditError::IntegrityError(_)));
        assert_eq!(store.len(), 3);
        assert!(store.checkpoints().await.unwrap().is_empty());
        assert!(store.active_integrity_hold().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_interrupted_deletion_leaves_ledger_intact() {
        let store = MemoryStore::new();
        for _ in 0..4 {
            append(&store, "PATIENT_VIEW", Outcome::Success, SEVEN_YEARS).await;
        }
        append(&store, "PATIENT_VIEW", Outcome::Success, 1).await;

        store.set_deletions_failing(true);
        let err = run_retention(&store, 2190, Utc::now()).await.unwrap_err();
        assert!(matches!(err, AuditError::DatabaseError(_)));
        assert_eq!(store.len(), 5);
        assert!(store.checkpoints().await.unwrap().is_empty());
        assert!(store.active_integrity_hold().await.unwrap().is_none());
        assert_verifies(&store).await;

        // The next run picks up where the failed one left off
        store.set_deletions_failing(false);
        let summary = completed(run_retention(&store, 2190, Utc::now()).await.unwrap());
        assert_eq!(summary.deleted, 4);
        assert_verifies(&store).await;
    }

    #[tokio::test]
    async fn test_checkpoints_are_chained_across_runs() {
        let store = MemoryStore::new();
        append(&store, "PATIENT_VIEW", Outcome::Success, SEVEN_YEARS).await;
        append(&store, "PATIENT_EXPORT", Outcome::Success, SEVEN_YEARS).await;
        append(&store, "PATIENT_VIEW", Outcome::Success, SEVEN_YEARS).await;
        append(&store, "PATIENT_VIEW", Outcome::Success, 1).await;

        let summary = completed(run_retention(&store, 2190, Utc::now()).await.unwrap());
        let checkpoints = store.checkpoints().await.unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].previous_checkpoint_hash, GENESIS_HASH);
        assert_eq!(checkpoints[1].previous_checkpoint_hash, checkpoints[0].checkpoint_hash);
        assert_eq!(summary.checkpoint_head, checkpoints[1].checkpoint_hash);
        assert!(verify_checkpoint_chain(&checkpoints).is_ok());
    }

    #[tokio::test]
    async fn test_nothing_to_delete_reports_current_head() {
        let store = MemoryStore::new();
        append(&store, "PATIENT_VIEW", Outcome::Success, 1).await;

        let summary = completed(run_retention(&store, 2190, Utc::now()).await.unwrap());
        assert_eq!(summary.deleted, 0);
        assert_eq!(summary.checkpoint_head, GENESIS_HASH);
    }
}
