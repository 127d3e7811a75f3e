//! Audit Service
//!
//! The collaborator-facing surface: constructed once at startup, cloned into
//! request handlers and scheduled jobs.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::access::AccessPolicy;
use crate::audit::detector::SuspiciousActivityDetector;
use crate::audit::event::{actions, actors, resources, roles, AuditEvent, NewAuditEvent, Outcome};
use crate::audit::persister::Persister;
use crate::audit::queue::EventQueue;
use crate::audit::verify::{verify_chain, VerificationResult};
use crate::audit::worker::{DrainStats, DrainWorker};
use crate::compliance::report::{generate_report, ComplianceReport};
use crate::compliance::scheduler::ComplianceScheduler;
use crate::config::AppConfig;
use crate::database::AuditStore;
use crate::error::{AuditError, Result};

/// Who is asking, as seen by the HTTP layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub actor_id: String,
    pub actor_role: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub method: String,
    pub path: String,
}

struct Inner {
    config: AppConfig,
    store: Arc<dyn AuditStore>,
    queue: Arc<EventQueue>,
    persister: Arc<Persister>,
    policy: AccessPolicy,
}

#[derive(Clone)]
pub struct AuditService {
    inner: Arc<Inner>,
}

impl AuditService {
    pub fn new(store: Arc<dyn AuditStore>, config: &AppConfig, policy: AccessPolicy) -> Self {
        let queue = Arc::new(EventQueue::new(config.audit.queue_capacity));
        let detector = Arc::new(SuspiciousActivityDetector::new(
            store.clone(),
            queue.clone(),
            config.detection.clone(),
        ));
        let persister = Arc::new(Persister::new(store.clone(), detector));

        Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                store,
                queue,
                persister,
                policy,
            }),
        }
    }

    /// Spawn the drain worker; it performs a final drain once `shutdown` flips to true
    pub fn start_worker(&self, shutdown: watch::Receiver<bool>) -> (JoinHandle<()>, Arc<DrainStats>) {
        let worker = DrainWorker::new(
            self.inner.queue.clone(),
            self.inner.persister.clone(),
            self.inner.config.audit.clone(),
        );
        let stats = worker.stats();
        (worker.spawn(shutdown), stats)
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn AuditStore> {
        self.inner.store.clone()
    }

    pub fn queue(&self) -> &EventQueue {
        &self.inner.queue
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.inner.policy
    }

    /// Accept an event for asynchronous persistence. Never blocks on I/O and never fails.
    pub fn record_event(&self, event: NewAuditEvent) -> AuditEvent {
        let event = AuditEvent::accept(event);
        debug!("Audit event accepted: {}", event.summary());
        self.inner.queue.enqueue(event.clone());
        event
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_auth_event(
        &self,
        actor_id: &str,
        actor_role: &str,
        action: &str,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
        outcome: Outcome,
        reason: Option<&str>,
    ) -> AuditEvent {
        let mut event = NewAuditEvent::new(actor_id, actor_role, action, resources::AUTHENTICATION, outcome)
            .with_resource_id(actor_id);
        event.ip_address = ip_address.map(str::to_string);
        event.user_agent = user_agent.map(str::to_string);
        event.reason = reason.map(str::to_string);
        self.record_event(event)
    }

    /// Record a read or write of patient data; `access_type` becomes the action suffix
    pub fn record_patient_access(
        &self,
        actor_id: &str,
        actor_role: &str,
        patient_id: &str,
        access_type: &str,
        outcome: Outcome,
        reason: Option<&str>,
    ) -> AuditEvent {
        let action = format!("PATIENT_{}", access_type.trim().to_ascii_uppercase());
        let mut event = NewAuditEvent::new(actor_id, actor_role, action, resources::PATIENT_DATA, outcome)
            .with_resource_id(patient_id)
            .with_patient_id(patient_id)
            .with_details(json!({ "access_type": access_type }));
        event.reason = reason.map(str::to_string);
        self.record_event(event)
    }

    pub async fn generate_compliance_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ComplianceReport> {
        let report = generate_report(self.inner.store.as_ref(), start, end).await?;
        info!(
            "Compliance report for {} .. {}: {} events, status {}",
            start, end, report.total_events, report.compliance_status
        );
        Ok(report)
    }

    pub fn check_access(&self, actor_role: &str, resource_category: &str) -> bool {
        self.inner.policy.check_access(actor_role, resource_category)
    }

    /// Enforce the access policy for a request, auditing every denial
    pub fn authorize(&self, ctx: &RequestContext, resource_category: &str) -> Result<()> {
        if self.check_access(&ctx.actor_role, resource_category) {
            return Ok(());
        }

        self.record_denial(
            ctx,
            resource_category,
            format!("role {} is not permitted to access {}", ctx.actor_role, resource_category),
        );
        Err(AuditError::access_denied(&ctx.actor_role, resource_category))
    }

    /// Record an event submitted over HTTP on behalf of the caller.
    ///
    /// Identity always comes from `ctx`. Only SYSTEM callers may submit
    /// reserved actions or act as the `system` actor.
    pub fn record_request_event(&self, ctx: &RequestContext, mut event: NewAuditEvent) -> Result<AuditEvent> {
        let is_system = ctx.actor_role == roles::SYSTEM;
        if !is_system && (actions::is_reserved(&event.action) || ctx.actor_id == actors::SYSTEM) {
            let reason = format!(
                "{} ({}) may not record {} events",
                ctx.actor_id, ctx.actor_role, event.action
            );
            self.record_denial(ctx, &event.resource, reason.clone());
            return Err(AuditError::AccessDenied(reason));
        }

        event.actor_id = ctx.actor_id.clone();
        event.actor_role = ctx.actor_role.clone();
        if ctx.ip_address.is_some() {
            event.ip_address = ctx.ip_address.clone();
        }
        if ctx.user_agent.is_some() {
            event.user_agent = ctx.user_agent.clone();
        }
        Ok(self.record_event(event))
    }

    fn record_denial(&self, ctx: &RequestContext, resource: &str, reason: String) {
        warn!(
            "Access denied: {} ({}) -> {} {}",
            ctx.actor_id, ctx.actor_role, ctx.method, ctx.path
        );
        let mut event = NewAuditEvent::new(
            ctx.actor_id.as_str(),
            ctx.actor_role.as_str(),
            actions::ACCESS_DENIED,
            resource,
            Outcome::Failure,
        )
        .with_details(json!({ "method": ctx.method, "path": ctx.path }))
        .with_reason(reason);
        event.ip_address = ctx.ip_address.clone();
        event.user_agent = ctx.user_agent.clone();
        self.record_event(event);
    }

    /// Persist everything queued right now, one bounded batch at a time
    pub async fn flush(&self) -> Result<usize> {
        let mut persisted = 0;
        while !self.inner.queue.is_empty() {
            let outcome = self
                .inner
                .persister
                .drain(&self.inner.queue, self.inner.config.audit.batch_size)
                .await?;
            persisted += outcome.persisted;
        }
        Ok(persisted)
    }

    /// Verify the whole ledger from genesis, honouring retention checkpoints
    pub async fn verify_ledger(&self) -> Result<VerificationResult> {
        let entries = self.inner.store.all_entries().await?;
        let checkpoints = self.inner.store.checkpoints().await?;
        Ok(verify_chain(&entries, &checkpoints, true))
    }

    /// Lift any integrity hold so retention may resume
    pub async fn clear_integrity_hold(&self, cleared_by: &str) -> Result<u64> {
        let cleared = self.inner.store.clear_integrity_holds(cleared_by).await?;
        if cleared > 0 {
            info!("{} integrity hold(s) cleared by {}", cleared, cleared_by);
            self.record_event(
                NewAuditEvent::system(actions::SYSTEM_INTEGRITY_HOLD_CLEARED, Outcome::Success)
                    .with_resource_id(resources::AUDIT)
                    .with_details(json!({ "cleared": cleared, "cleared_by": cleared_by })),
            );
        }
        Ok(cleared)
    }
}

/// The drain worker and the scheduler jobs of a running service.
///
/// Each side has its own shutdown channel: scheduler jobs stop first and any
/// run in flight completes, then the worker makes its final drain, so job
/// outcome events recorded during shutdown are still persisted.
pub struct BackgroundTasks {
    scheduler_shutdown: watch::Sender<bool>,
    worker_shutdown: watch::Sender<bool>,
    jobs: Vec<JoinHandle<()>>,
    worker: JoinHandle<()>,
    stats: Arc<DrainStats>,
}

impl BackgroundTasks {
    pub fn start(service: &AuditService, scheduler: &ComplianceScheduler) -> Self {
        let (worker_shutdown, worker_rx) = watch::channel(false);
        let (scheduler_shutdown, scheduler_rx) = watch::channel(false);
        let (worker, stats) = service.start_worker(worker_rx);
        let jobs = scheduler.spawn(scheduler_rx);

        Self {
            scheduler_shutdown,
            worker_shutdown,
            jobs,
            worker,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<DrainStats> {
        self.stats.clone()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub async fn shutdown(self) {
        let _ = self.scheduler_shutdown.send(true);
        for job in self.jobs {
            if let Err(e) = job.await {
                error!("Compliance job panicked: {}", e);
            }
        }
        info!("Compliance scheduler stopped");

        let _ = self.worker_shutdown.send(true);
        if let Err(e) = self.worker.await {
            error!("Audit drain worker panicked: {}", e);
        }
    }
}
