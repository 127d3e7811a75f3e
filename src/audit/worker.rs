//! Drain Worker
//!
//! The single background task that moves events from the queue into the
//! ledger: on a fixed interval, and immediately when an escalated event
//! arrives.

use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::audit::event::{actions, AuditEvent, NewAuditEvent, Outcome};
use crate::audit::persister::Persister;
use crate::audit::queue::EventQueue;
use crate::config::AuditConfig;

#[derive(Debug, Default)]
pub struct DrainStats {
    pub periodic_drains: AtomicU64,
    pub escalated_drains: AtomicU64,
    pub failed_drains: AtomicU64,
}

impl DrainStats {
    pub fn escalated(&self) -> u64 {
        self.escalated_drains.load(Ordering::Relaxed)
    }

    pub fn periodic(&self) -> u64 {
        self.periodic_drains.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed_drains.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Periodic,
    Escalation,
}

pub struct DrainWorker {
    queue: Arc<EventQueue>,
    persister: Arc<Persister>,
    config: AuditConfig,
    stats: Arc<DrainStats>,
    consecutive_failures: u32,
    reported_drops: u64,
}

impl DrainWorker {
    pub fn new(queue: Arc<EventQueue>, persister: Arc<Persister>, config: AuditConfig) -> Self {
        Self {
            queue,
            persister,
            config,
            stats: Arc::new(DrainStats::default()),
            consecutive_failures: 0,
            reported_drops: 0,
        }
    }

    pub fn stats(&self) -> Arc<DrainStats> {
        self.stats.clone()
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.flush_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Audit drain worker started (every {:?}, batch {})",
            self.config.flush_interval(),
            self.config.batch_size
        );

        loop {
            tokio::select! {
                _ = interval.tick() => self.drain_cycle(Trigger::Periodic).await,
                _ = self.queue.escalated() => self.drain_cycle(Trigger::Escalation).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.final_drain().await;
        info!("Audit drain worker stopped");
    }

    async fn drain_cycle(&mut self, trigger: Trigger) {
        match trigger {
            Trigger::Periodic => self.stats.periodic_drains.fetch_add(1, Ordering::Relaxed),
            Trigger::Escalation => self.stats.escalated_drains.fetch_add(1, Ordering::Relaxed),
        };

        match self.persister.drain(&self.queue, self.config.batch_size).await {
            Ok(_) => {
                if self.consecutive_failures > 0 {
                    info!(
                        "Audit persistence recovered after {} failed drains",
                        self.consecutive_failures
                    );
                    self.record_system(
                        NewAuditEvent::system(actions::SYSTEM_AUDIT_PERSISTENCE_RECOVERED, Outcome::Success)
                            .with_resource_id("audit_log")
                            .with_details(json!({ "failed_drains": self.consecutive_failures })),
                    );
                    self.consecutive_failures = 0;
                }
            }
            Err(e) => {
                self.stats.failed_drains.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.max_consecutive_failures {
                    error!(
                        "ALERT: audit persistence failing for {} consecutive drains, {} events queued: {}",
                        self.consecutive_failures,
                        self.queue.len(),
                        e
                    );
                } else if e.is_retryable() {
                    warn!("Audit drain failed ({:?}), will retry: {}", trigger, e);
                } else {
                    error!("Audit drain failed ({:?}): {}", trigger, e);
                }
            }
        }

        self.report_drops();
    }

    fn report_drops(&mut self) {
        let dropped = self.queue.dropped_count();
        if dropped > self.reported_drops {
            let delta = dropped - self.reported_drops;
            self.reported_drops = dropped;
            self.record_system(
                NewAuditEvent::system(actions::SYSTEM_AUDIT_EVENTS_DROPPED, Outcome::Warning)
                    .with_resource_id("audit_queue")
                    .with_details(json!({ "dropped": delta, "capacity": self.queue.capacity() }))
                    .with_reason("audit queue capacity exceeded"),
            );
        }
    }

    fn record_system(&self, event: NewAuditEvent) {
        self.queue.enqueue(AuditEvent::accept(event));
    }

    /// Persist whatever is left, stopping at the first failure
    async fn final_drain(&mut self) {
        while !self.queue.is_empty() {
            if let Err(e) = self.persister.drain(&self.queue, self.config.batch_size).await {
                error!(
                    "Final audit drain failed, {} events not persisted: {}",
                    self.queue.len(),
                    e
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::detector::SuspiciousActivityDetector;
    use crate::config::DetectionConfig;
    use crate::database::{AuditStore, MemoryStore};
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<EventQueue>,
        stats: Arc<DrainStats>,
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<()>,
    }

    fn start(flush_interval_secs: u64) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(EventQueue::new(1_000));
        let detector = Arc::new(SuspiciousActivityDetector::new(
            store.clone(),
            queue.clone(),
            DetectionConfig::default(),
        ));
        let persister = Arc::new(Persister::new(store.clone(), detector));
        let config = AuditConfig {
            flush_interval_secs,
            ..AuditConfig::default()
        };
        let worker = DrainWorker::new(queue.clone(), persister, config);
        let stats = worker.stats();
        let (shutdown, rx) = watch::channel(false);
        let handle = worker.spawn(rx);
        Harness { store, queue, stats, shutdown, handle }
    }

    fn event(action: &str, outcome: Outcome) -> AuditEvent {
        AuditEvent::accept(NewAuditEvent::new("u1", "NURSE", action, "patient_data", outcome))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_escalated_event_flushes_before_next_tick() {
        let h = start(3600);
        // Let the immediate first tick pass
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut tasks = Vec::new();
        for i in 0..9 {
            let queue = h.queue.clone();
            tasks.push(tokio::spawn(async move {
                queue.enqueue(event(&format!("PATIENT_VIEW_{}", i), Outcome::Success));
            }));
        }
        let queue = h.queue.clone();
        let critical = event("AUTH_FAILED_LOGIN", Outcome::Failure);
        let critical_id = critical.event_id;
        tasks.push(tokio::spawn(async move { queue.enqueue(critical) }));
        for task in tasks {
            task.await.unwrap();
        }

        let store = h.store.clone();
        assert!(
            wait_for(|| store.len() > 0).await,
            "escalated event should be persisted without waiting for the periodic tick"
        );
        assert!(h.stats.escalated() >= 1);
        assert_eq!(h.stats.periodic(), 1);
        assert!(h.store.contains_event(&critical_id).await.unwrap());

        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap();
        assert_eq!(h.store.len(), 10);
    }

    #[tokio::test]
    async fn test_periodic_drain_is_bounded() {
        let h = start(3600);
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 0..200 {
            h.queue.enqueue(event(&format!("PATIENT_VIEW_{}", i), Outcome::Success));
        }
        // One escalation triggers exactly one bounded cycle
        h.queue.enqueue(event("PATIENT_EXPORT", Outcome::Success));

        let store = h.store.clone();
        assert!(wait_for(|| store.len() == 50).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.store.len(), 50);
        assert_eq!(h.queue.len(), 151);

        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap();

        let entries = h.store.all_entries().await.unwrap();
        assert_eq!(entries.len(), 201);
        let actions: Vec<_> = entries.iter().map(|e| e.event.action.clone()).collect();
        let expected: Vec<_> = (0..200)
            .map(|i| format!("PATIENT_VIEW_{}", i))
            .chain(std::iter::once("PATIENT_EXPORT".to_string()))
            .collect();
        assert_eq!(actions, expected);
    }

    #[tokio::test]
    async fn test_recovery_is_recorded() {
        let h = start(3600);
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.store.set_unavailable(true);
        h.queue.enqueue(event("PATIENT_DELETE", Outcome::Success));
        let stats = h.stats.clone();
        assert!(wait_for(|| stats.failed() >= 1).await);
        assert_eq!(h.queue.len(), 1);

        h.store.set_unavailable(false);
        h.queue.enqueue(event("PATIENT_DELETE", Outcome::Success));
        let store = h.store.clone();
        assert!(wait_for(|| store.len() >= 2).await);

        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap();

        let entries = h.store.all_entries().await.unwrap();
        assert!(entries
            .iter()
            .any(|e| e.event.action == actions::SYSTEM_AUDIT_PERSISTENCE_RECOVERED));
    }
}
