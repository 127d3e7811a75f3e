//! Ledger Maintenance
//!
//! Periodic re-verification of recently persisted entries. A failure raises
//! a persistent integrity hold that stops retention until cleared by hand.

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info};

use crate::audit::verify::{verify_chain, VerificationResult};
use crate::database::AuditStore;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct MaintenanceOutcome {
    pub window_start: DateTime<Utc>,
    pub result: VerificationResult,
    /// Set when this run raised a hold
    pub hold_id: Option<i64>,
}

pub async fn run_maintenance(
    store: &dyn AuditStore,
    window_days: i64,
    now: DateTime<Utc>,
) -> Result<MaintenanceOutcome> {
    let window_start = now - Duration::days(window_days);
    let entries = store.entries_persisted_since(window_start).await?;
    let checkpoints = store.checkpoints().await?;

    let result = verify_chain(&entries, &checkpoints, false);
    let hold_id = if result.is_valid {
        info!(
            "Ledger maintenance verified {} entries since {}",
            result.entry_count, window_start
        );
        None
    } else {
        let reason = result
            .error_message
            .clone()
            .unwrap_or_else(|| "hash chain verification failed".to_string());
        error!("Ledger maintenance found an integrity violation: {}", reason);
        Some(store.set_integrity_hold(&reason).await?)
    };

    Ok(MaintenanceOutcome {
        window_start,
        result,
        hold_id,
    })
}
