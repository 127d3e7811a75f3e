//! Audit Persister
//!
//! Chains and writes drained batches. The read-head, hash, write sequence runs
//! under a single write lock so concurrent drains cannot fork the chain.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::audit::chain::{next_hash, GENESIS_HASH};
use crate::audit::detector::SuspiciousActivityDetector;
use crate::audit::event::AuditEvent;
use crate::audit::queue::EventQueue;
use crate::database::AuditStore;
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub persisted: usize,
    /// Already present from an earlier, partially failed attempt
    pub skipped: usize,
    pub alerts: usize,
}

pub struct Persister {
    store: Arc<dyn AuditStore>,
    detector: Arc<SuspiciousActivityDetector>,
    write_lock: Mutex<()>,
}

impl Persister {
    pub fn new(store: Arc<dyn AuditStore>, detector: Arc<SuspiciousActivityDetector>) -> Self {
        Self {
            store,
            detector,
            write_lock: Mutex::new(()),
        }
    }

    /// Persist a batch in order, stopping at the first failure
    pub async fn persist(&self, batch: &[AuditEvent]) -> Result<PersistOutcome> {
        let _guard = self.write_lock.lock().await;
        self.persist_locked(batch).await
    }

    /// Take one batch from the queue and persist it. On failure the whole
    /// batch goes back to the front of the queue; entries that did land are
    /// skipped on retry by event id.
    pub async fn drain(&self, queue: &EventQueue, max: usize) -> Result<PersistOutcome> {
        let _guard = self.write_lock.lock().await;

        let batch = queue.drain_batch(max);
        if batch.is_empty() {
            return Ok(PersistOutcome::default());
        }

        match self.persist_locked(&batch).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!("Audit batch of {} failed, requeueing: {}", batch.len(), e);
                queue.requeue_front(batch);
                Err(e)
            }
        }
    }

    async fn persist_locked(&self, batch: &[AuditEvent]) -> Result<PersistOutcome> {
        let mut outcome = PersistOutcome::default();

        for event in batch {
            if self.store.contains_event(&event.event_id).await? {
                debug!("Skipping already persisted audit event {}", event.event_id);
                outcome.skipped += 1;
                continue;
            }

            let previous = self
                .store
                .last_hash()
                .await?
                .unwrap_or_else(|| GENESIS_HASH.to_string());
            let hash = next_hash(&previous, event)?;
            let entry = self.store.insert_entry(event, &previous, &hash).await?;
            outcome.persisted += 1;

            outcome.alerts += self.detector.on_persisted(&entry).await.len();
        }

        if outcome.persisted > 0 {
            info!(
                "Persisted {} audit events ({} skipped, {} alerts raised)",
                outcome.persisted, outcome.skipped, outcome.alerts
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{NewAuditEvent, Outcome};
    use crate::audit::verify::verify_chain;
    use crate::config::DetectionConfig;
    use crate::database::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, Arc<EventQueue>, Arc<Persister>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(EventQueue::new(1_000));
        let detector = Arc::new(SuspiciousActivityDetector::new(
            store.clone(),
            queue.clone(),
            DetectionConfig::default(),
        ));
        let persister = Arc::new(Persister::new(store.clone(), detector));
        (store, queue, persister)
    }

    fn event(i: usize) -> AuditEvent {
        AuditEvent::accept(NewAuditEvent::new(
            format!("u{}", i % 3),
            "NURSE",
            "PATIENT_VIEW",
            "patient_data",
            Outcome::Success,
        ))
    }

    #[tokio::test]
    async fn test_persist_builds_verifiable_chain() {
        let (store, _queue, persister) = setup();
        let batch: Vec<_> = (0..10).map(event).collect();

        let outcome = persister.persist(&batch).await.unwrap();
        assert_eq!(outcome.persisted, 10);

        let entries = store.all_entries().await.unwrap();
        assert_eq!(entries[0].previous_hash, GENESIS_HASH);
        assert!(verify_chain(&entries, &[], true).is_valid);
    }

    #[tokio::test]
    async fn test_retry_skips_already_persisted() {
        let (store, _queue, persister) = setup();
        let batch: Vec<_> = (0..4).map(event).collect();

        persister.persist(&batch[..2]).await.unwrap();
        let outcome = persister.persist(&batch).await.unwrap();

        assert_eq!(outcome, PersistOutcome { persisted: 2, skipped: 2, alerts: 0 });
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_failed_drain_requeues_batch() {
        let (store, queue, persister) = setup();
        for i in 0..5 {
            queue.enqueue(event(i));
        }

        store.set_unavailable(true);
        assert!(persister.drain(&queue, 50).await.is_err());
        assert_eq!(queue.len(), 5);

        store.set_unavailable(false);
        assert_eq!(persister.drain(&queue, 50).await.unwrap().persisted, 5);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_drains_keep_chain_linear() {
        let (store, queue, persister) = setup();
        store.set_write_delay(std::time::Duration::from_millis(2));
        for i in 0..40 {
            queue.enqueue(event(i));
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let persister = persister.clone();
                tokio::spawn(async move { persister.drain(&queue, 10).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let entries = store.all_entries().await.unwrap();
        assert_eq!(entries.len(), 40);
        assert!(verify_chain(&entries, &[], true).is_valid);
    }
}
