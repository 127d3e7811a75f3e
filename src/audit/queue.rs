//! Event Queue
//!
//! Bounded in-process buffer between request handlers and the drain worker.
//! `enqueue` is synchronous and never waits on I/O; the lock is held only for
//! constant-time buffer operations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::audit::event::AuditEvent;

pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Default)]
struct QueueState {
    buffer: VecDeque<AuditEvent>,
    dropped: u64,
}

pub struct EventQueue {
    state: Mutex<QueueState>,
    escalation: Notify,
    escalations: AtomicU64,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            escalation: Notify::new(),
            escalations: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic elsewhere must not stop ingestion
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accept an event. HIGH and CRITICAL events also wake the drain worker.
    pub fn enqueue(&self, event: AuditEvent) {
        let escalated = event.risk_level.is_escalated();
        {
            let mut state = self.lock();
            if state.buffer.len() >= self.capacity {
                self.evict_one(&mut state);
            }
            state.buffer.push_back(event);
        }

        if escalated {
            self.escalations.fetch_add(1, Ordering::Relaxed);
            self.escalation.notify_one();
        }
    }

    /// Remove up to `max` events from the front, in queue order
    pub fn drain_batch(&self, max: usize) -> Vec<AuditEvent> {
        let mut state = self.lock();
        let count = max.min(state.buffer.len());
        state.buffer.drain(..count).collect()
    }

    /// Put a failed batch back at the front, preserving its order
    pub fn requeue_front(&self, batch: Vec<AuditEvent>) {
        let mut state = self.lock();
        debug!("Requeueing {} audit events after failed drain", batch.len());
        for event in batch.into_iter().rev() {
            state.buffer.push_front(event);
        }
        while state.buffer.len() > self.capacity {
            self.evict_one(&mut state);
        }
    }

    /// Drop the oldest event below HIGH; if none exists, the oldest event
    fn evict_one(&self, state: &mut QueueState) {
        let position = state
            .buffer
            .iter()
            .position(|e| !e.risk_level.is_escalated())
            .unwrap_or(0);

        if let Some(dropped) = state.buffer.remove(position) {
            state.dropped += 1;
            if dropped.risk_level.is_escalated() {
                error!(
                    "Audit queue full ({}): dropped escalated event {} ({})",
                    self.capacity,
                    dropped.event_id,
                    dropped.summary()
                );
            } else {
                warn!(
                    "Audit queue full ({}): dropped event {} ({})",
                    self.capacity,
                    dropped.event_id,
                    dropped.summary()
                );
            }
        }
    }

    /// Wait until an escalated event has been enqueued since the last wake-up
    pub async fn escalated(&self) {
        self.escalation.notified().await
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    /// Number of escalated events accepted so far
    pub fn escalation_count(&self) -> u64 {
        self.escalations.load(Ordering::Relaxed)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
