//! In-memory ledger store
//!
//! Used for `memory://` deployments and tests. Supports simulated outages and
//! write latency so drain retry and non-blocking behaviour can be exercised.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::audit::chain::GENESIS_HASH;
use crate::audit::event::{AuditEvent, AuditLogEntry};
use crate::database::models::{ChainCheckpoint, ChainLink, IntegrityHold};
use crate::database::AuditStore;
use crate::error::{AuditError, Result};

#[derive(Default)]
struct MemoryState {
    entries: Vec<AuditLogEntry>,
    next_id: i64,
    checkpoints: Vec<ChainCheckpoint>,
    holds: Vec<IntegrityHold>,
    next_aux_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    failing_deletions: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the datastore being unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail retention deletions while leaving reads and appends working
    pub fn set_deletions_failing(&self, failing: bool) {
        self.failing_deletions.store(failing, Ordering::SeqCst);
    }

    /// Simulate slow writes
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a stored entry in place; only for exercising tamper detection
    pub fn tamper<F: FnOnce(&mut AuditLogEntry)>(&self, id: i64, f: F) -> bool {
        let mut state = self.lock();
        match state.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuditError::DatabaseError("memory store unavailable".to_string()));
        }
        Ok(())
    }

    fn filtered<P: Fn(&AuditLogEntry) -> bool>(&self, predicate: P) -> Result<Vec<AuditLogEntry>> {
        self.check_available()?;
        Ok(self.lock().entries.iter().filter(|e| predicate(e)).cloned().collect())
    }
}

fn eligible_for_deletion(entry: &AuditLogEntry, cutoff: DateTime<Utc>) -> bool {
    entry.event.timestamp < cutoff && !entry.event.risk_level.is_escalated()
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn last_hash(&self) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.lock().entries.last().map(|e| e.hash_chain.clone()))
    }

    async fn contains_event(&self, event_id: &Uuid) -> Result<bool> {
        self.check_available()?;
        Ok(self.lock().entries.iter().any(|e| e.event.event_id == *event_id))
    }

    async fn insert_entry(
        &self,
        event: &AuditEvent,
        previous_hash: &str,
        hash_chain: &str,
    ) -> Result<AuditLogEntry> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_available()?;

        let mut state = self.lock();
        if state.entries.iter().any(|e| e.event.event_id == event.event_id) {
            return Err(AuditError::DatabaseError(format!(
                "UNIQUE constraint failed: audit_log.event_id ({})",
                event.event_id
            )));
        }

        state.next_id += 1;
        let entry = AuditLogEntry {
            id: state.next_id,
            event: event.clone(),
            previous_hash: previous_hash.to_string(),
            hash_chain: hash_chain.to_string(),
            created_at: Utc::now().trunc_subsecs(6),
        };
        state.entries.push(entry.clone());
        Ok(entry)
    }

    async fn actor_events_since(&self, actor_id: &str, since: DateTime<Utc>) -> Result<Vec<AuditLogEntry>> {
        self.filtered(|e| e.event.actor_id == actor_id && e.event.timestamp >= since)
    }

    async fn entries_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<AuditLogEntry>> {
        self.filtered(|e| e.event.timestamp >= start && e.event.timestamp <= end)
    }

    async fn entries_persisted_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditLogEntry>> {
        self.filtered(|e| e.created_at >= since)
    }

    async fn all_entries(&self) -> Result<Vec<AuditLogEntry>> {
        self.filtered(|_| true)
    }

    async fn max_expired_id(&self, cutoff: DateTime<Utc>) -> Result<Option<i64>> {
        self.check_available()?;
        Ok(self
            .lock()
            .entries
            .iter()
            .filter(|e| eligible_for_deletion(e, cutoff))
            .map(|e| e.id)
            .max())
    }

    async fn chain_links(&self, after_id: i64, limit: i64) -> Result<Vec<ChainLink>> {
        self.check_available()?;
        Ok(self
            .lock()
            .entries
            .iter()
            .filter(|e| e.id > after_id)
            .take(limit.max(0) as usize)
            .map(|e| ChainLink {
                id: e.id,
                timestamp: e.event.timestamp,
                risk_level: e.event.risk_level,
                previous_hash: e.previous_hash.clone(),
                hash_chain: e.hash_chain.clone(),
            })
            .collect())
    }

    async fn delete_run_with_checkpoint(
        &self,
        checkpoint: &ChainCheckpoint,
        ids: &[i64],
        cutoff: DateTime<Utc>,
    ) -> Result<i64> {
        self.check_available()?;
        if self.failing_deletions.load(Ordering::SeqCst) {
            return Err(AuditError::DatabaseError("retention delete interrupted".to_string()));
        }

        let mut state = self.lock();
        let head = state
            .checkpoints
            .last()
            .map(|c| c.checkpoint_hash.as_str())
            .unwrap_or(GENESIS_HASH);
        if head != checkpoint.previous_checkpoint_hash {
            return Err(AuditError::IntegrityError(format!(
                "checkpoint chain head is {}, checkpoint follows {}",
                head, checkpoint.previous_checkpoint_hash
            )));
        }
        for id in ids {
            let deletable = state
                .entries
                .iter()
                .any(|e| e.id == *id && eligible_for_deletion(e, cutoff));
            if !deletable {
                return Err(AuditError::IntegrityError(format!(
                    "entry {} is missing or no longer eligible for deletion",
                    id
                )));
            }
        }

        state.next_aux_id += 1;
        let id = state.next_aux_id;
        state.checkpoints.push(ChainCheckpoint {
            id,
            ..checkpoint.clone()
        });
        state.entries.retain(|e| !ids.contains(&e.id));
        Ok(id)
    }

    async fn checkpoints(&self) -> Result<Vec<ChainCheckpoint>> {
        self.check_available()?;
        Ok(self.lock().checkpoints.clone())
    }

    async fn active_integrity_hold(&self) -> Result<Option<IntegrityHold>> {
        self.check_available()?;
        Ok(self.lock().holds.first().cloned())
    }

    async fn set_integrity_hold(&self, reason: &str) -> Result<i64> {
        self.check_available()?;
        let mut state = self.lock();
        state.next_aux_id += 1;
        let id = state.next_aux_id;
        state.holds.push(IntegrityHold {
            id,
            reason: reason.to_string(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn clear_integrity_holds(&self, _cleared_by: &str) -> Result<u64> {
        self.check_available()?;
        let mut state = self.lock();
        let cleared = state.holds.len() as u64;
        state.holds.clear();
        Ok(cleared)
    }
}
