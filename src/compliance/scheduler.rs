//! Compliance Scheduler
//!
//! Runs retention, reporting and maintenance on independent timers. Each run
//! is guarded against overlapping itself, bounded by a timeout, and closes
//! the loop by recording a `SYSTEM_*` event in the ledger.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::audit::event::{actions, resources, NewAuditEvent, Outcome};
use crate::audit::verify::CHECKPOINT_HEAD_KEY;
use crate::compliance::maintenance::{run_maintenance, MaintenanceOutcome};
use crate::compliance::report::{write_report, ComplianceReport};
use crate::compliance::retention::{run_retention, RetentionOutcome};
use crate::config::ComplianceConfig;
use crate::error::{AuditError, Result};
use crate::service::AuditService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Retention,
    Report,
    Maintenance,
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::Retention => "retention cleanup",
            Job::Report => "compliance report",
            Job::Maintenance => "ledger maintenance",
        }
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobRun<T> {
    Completed(T),
    /// The previous run of the same job had not finished
    AlreadyRunning,
}

/// Held for the duration of a run; releases the job's flag on drop
struct JobGuard<'a>(&'a AtomicBool);

impl<'a> JobGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| JobGuard(flag))
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct SchedulerInner {
    service: AuditService,
    config: ComplianceConfig,
    retention_running: AtomicBool,
    report_running: AtomicBool,
    maintenance_running: AtomicBool,
}

#[derive(Clone)]
pub struct ComplianceScheduler {
    inner: Arc<SchedulerInner>,
}

impl ComplianceScheduler {
    pub fn new(service: AuditService, config: ComplianceConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                service,
                config,
                retention_running: AtomicBool::new(false),
                report_running: AtomicBool::new(false),
                maintenance_running: AtomicBool::new(false),
            }),
        }
    }

    fn flag(&self, job: Job) -> &AtomicBool {
        match job {
            Job::Retention => &self.inner.retention_running,
            Job::Report => &self.inner.report_running,
            Job::Maintenance => &self.inner.maintenance_running,
        }
    }

    /// Start one timer task per job. The first run of each happens one full period after startup.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        if !self.inner.config.enabled {
            info!("Compliance scheduler disabled");
            return Vec::new();
        }

        let config = &self.inner.config;
        vec![
            self.spawn_job(Job::Retention, config.retention_interval(), shutdown.clone()),
            self.spawn_job(Job::Report, config.report_interval(), shutdown.clone()),
            self.spawn_job(Job::Maintenance, config.maintenance_interval(), shutdown),
        ]
    }

    fn spawn_job(&self, job: Job, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Scheduled {} every {:?}", job, period);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.run_now(job).await {
                            error!("Scheduled {} failed: {}", job, e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Stopped {} schedule", job);
        })
    }

    pub async fn run_now(&self, job: Job) -> Result<()> {
        match job {
            Job::Retention => self.run_retention_now().await.map(|_| ()),
            Job::Report => self.run_report_now().await.map(|_| ()),
            Job::Maintenance => self.run_maintenance_now().await.map(|_| ()),
        }
    }

    async fn guarded<T, F>(&self, job: Job, work: F) -> Result<JobRun<T>>
    where
        F: Future<Output = Result<T>>,
    {
        let _guard = match JobGuard::acquire(self.flag(job)) {
            Some(guard) => guard,
            None => {
                warn!("Skipping {}: previous run still in progress", job);
                return Ok(JobRun::AlreadyRunning);
            }
        };

        match tokio::time::timeout(self.inner.config.job_timeout(), work).await {
            Ok(result) => result.map(JobRun::Completed),
            Err(_) => Err(AuditError::job_timeout(job.name(), self.inner.config.job_timeout_secs)),
        }
    }

    fn record(&self, event: NewAuditEvent) {
        self.inner.service.record_event(event);
    }

    pub async fn run_retention_now(&self) -> Result<JobRun<RetentionOutcome>> {
        let store = self.inner.service.store();
        let days = self.inner.config.retention_days;
        let run = self
            .guarded(Job::Retention, async move {
                run_retention(store.as_ref(), days, Utc::now()).await
            })
            .await;

        match &run {
            Ok(JobRun::Completed(RetentionOutcome::Completed(summary))) => {
                let mut details = json!({
                    "deleted": summary.deleted,
                    "deferred": summary.deferred,
                    "cutoff": summary.cutoff,
                    "retention_days": days,
                    "checkpoint_ids": summary.checkpoint_ids,
                });
                // Seals the checkpoint chain into the ledger
                details[CHECKPOINT_HEAD_KEY] = json!(summary.checkpoint_head);
                self.record(
                    NewAuditEvent::system(actions::SYSTEM_RETENTION_CLEANUP, Outcome::Success)
                        .with_resource_id(resources::AUDIT)
                        .with_details(details),
                )
            }
            Ok(JobRun::Completed(RetentionOutcome::Skipped { reason })) => self.record(
                NewAuditEvent::system(actions::SYSTEM_RETENTION_SKIPPED, Outcome::Warning)
                    .with_resource_id(resources::AUDIT)
                    .with_reason(format!("integrity hold active: {}", reason)),
            ),
            Ok(JobRun::AlreadyRunning) => {}
            Err(AuditError::IntegrityError(message)) => self.record(
                NewAuditEvent::system(actions::AUDIT_INTEGRITY_VIOLATION, Outcome::Failure)
                    .with_resource_id(resources::AUDIT)
                    .with_details(json!({ "detected_by": Job::Retention.name() }))
                    .with_reason(message.clone()),
            ),
            Err(e) => self.record(
                NewAuditEvent::system(actions::SYSTEM_RETENTION_FAILED, Outcome::Failure)
                    .with_resource_id(resources::AUDIT)
                    .with_reason(e.to_string()),
            ),
        }
        run
    }

    pub async fn run_report_now(&self) -> Result<JobRun<ComplianceReport>> {
        let service = self.inner.service.clone();
        let window = ChronoDuration::days(self.inner.config.report_window_days);
        let reports_dir = self.inner.config.reports_dir.clone();

        let run = self
            .guarded(Job::Report, async move {
                let end = Utc::now();
                let report = service.generate_compliance_report(end - window, end).await?;
                let path = match reports_dir {
                    Some(dir) => Some(write_report(Path::new(&dir), &report).await?),
                    None => None,
                };
                Ok::<_, AuditError>((report, path))
            })
            .await;

        match run {
            Ok(JobRun::Completed((report, path))) => {
                self.record(
                    NewAuditEvent::system(actions::SYSTEM_COMPLIANCE_REPORT_GENERATED, Outcome::Success)
                        .with_resource_id(resources::AUDIT)
                        .with_details(json!({
                            "start": report.start,
                            "end": report.end,
                            "total_events": report.total_events,
                            "high_risk_events": report.high_risk_events,
                            "failure_rate": report.failure_rate,
                            "compliance_status": report.compliance_status,
                            "path": path.map(|p| p.display().to_string()),
                        })),
                );
                Ok(JobRun::Completed(report))
            }
            Ok(JobRun::AlreadyRunning) => Ok(JobRun::AlreadyRunning),
            Err(e) => {
                self.record(
                    NewAuditEvent::system(actions::SYSTEM_COMPLIANCE_REPORT_FAILED, Outcome::Failure)
                        .with_resource_id(resources::AUDIT)
                        .with_reason(e.to_string()),
                );
                Err(e)
            }
        }
    }

    pub async fn run_maintenance_now(&self) -> Result<JobRun<MaintenanceOutcome>> {
        let store = self.inner.service.store();
        let window_days = self.inner.config.maintenance_window_days;
        let run = self
            .guarded(Job::Maintenance, async move {
                run_maintenance(store.as_ref(), window_days, Utc::now()).await
            })
            .await;

        match &run {
            Ok(JobRun::Completed(outcome)) if outcome.result.is_valid => self.record(
                NewAuditEvent::system(actions::SYSTEM_LEDGER_VERIFIED, Outcome::Success)
                    .with_resource_id(resources::AUDIT)
                    .with_details(json!({
                        "window_start": outcome.window_start,
                        "entries_verified": outcome.result.entry_count,
                        "bridged_gaps": outcome.result.bridged_gaps,
                    })),
            ),
            Ok(JobRun::Completed(outcome)) => self.record(
                NewAuditEvent::system(actions::AUDIT_INTEGRITY_VIOLATION, Outcome::Failure)
                    .with_resource_id(resources::AUDIT)
                    .with_details(json!({
                        "detected_by": Job::Maintenance.name(),
                        "window_start": outcome.window_start,
                        "first_invalid_id": outcome.result.first_invalid_id,
                        "hold_id": outcome.hold_id,
                    }))
                    .with_reason(
                        outcome
                            .result
                            .error_message
                            .clone()
                            .unwrap_or_else(|| "hash chain verification failed".to_string()),
                    ),
            ),
            Ok(JobRun::AlreadyRunning) => {}
            Err(e) => self.record(
                NewAuditEvent::system(actions::SYSTEM_LEDGER_MAINTENANCE_FAILED, Outcome::Failure)
                    .with_resource_id(resources::AUDIT)
                    .with_reason(e.to_string()),
            ),
        }
        run
    }
}
