//! Suspicious Activity Detection
//!
//! Advisory heuristics run against each freshly persisted entry. Alerts are
//! fed back through the event queue; nothing here denies a request.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

use crate::audit::event::{actions, actors, roles, AuditEvent, AuditLogEntry, NewAuditEvent, Outcome, UNKNOWN};
use crate::audit::queue::EventQueue;
use crate::config::DetectionConfig;
use crate::database::AuditStore;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AlertKey {
    action: &'static str,
    actor_id: String,
    patient_id: Option<String>,
}

pub struct SuspiciousActivityDetector {
    store: Arc<dyn AuditStore>,
    queue: Arc<EventQueue>,
    config: DetectionConfig,
    recent_alerts: Mutex<HashMap<AlertKey, DateTime<Utc>>>,
}

impl SuspiciousActivityDetector {
    pub fn new(store: Arc<dyn AuditStore>, queue: Arc<EventQueue>, config: DetectionConfig) -> Self {
        Self {
            store,
            queue,
            config,
            recent_alerts: Mutex::new(HashMap::new()),
        }
    }

    fn window(&self) -> Duration {
        Duration::minutes(self.config.window_minutes)
    }

    /// Analyse a persisted entry and enqueue any alerts. Errors are logged, never raised.
    pub async fn on_persisted(&self, entry: &AuditLogEntry) -> Vec<AuditEvent> {
        let alerts = match self.analyze(entry).await {
            Ok(alerts) => alerts,
            Err(e) => {
                error!("Suspicious activity check failed for {}: {}", entry.event.event_id, e);
                return Vec::new();
            }
        };

        alerts
            .into_iter()
            .map(|alert| {
                let event = AuditEvent::accept(alert);
                warn!("Suspicious activity detected: {}", event.summary());
                self.queue.enqueue(event.clone());
                event
            })
            .collect()
    }

    async fn analyze(&self, entry: &AuditLogEntry) -> Result<Vec<NewAuditEvent>> {
        let event = &entry.event;
        if event.actor_id == actors::SYSTEM || event.actor_role == roles::SYSTEM {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let history = self
            .store
            .actor_events_since(&event.actor_id, now - self.window())
            .await?;

        let mut alerts = Vec::new();

        if event.action == actions::AUTH_FAILED_LOGIN {
            let failures = history
                .iter()
                .filter(|e| e.event.action == actions::AUTH_FAILED_LOGIN)
                .count();
            if failures >= self.config.failed_login_threshold {
                let key = AlertKey {
                    action: actions::SUSPICIOUS_LOGIN_ATTEMPTS,
                    actor_id: event.actor_id.clone(),
                    patient_id: None,
                };
                if self.claim_alert(key, now) {
                    alerts.push(self.alert(
                        actions::SUSPICIOUS_LOGIN_ATTEMPTS,
                        event,
                        format!(
                            "{} failed logins for {} within {} minutes",
                            failures, event.actor_id, self.config.window_minutes
                        ),
                        json!({ "failed_attempts": failures }),
                    ));
                }
            }
        }

        if let Some(patient_id) = &event.patient_id {
            let accesses = history
                .iter()
                .filter(|e| e.event.patient_id.as_deref() == Some(patient_id.as_str()))
                .count();
            if accesses >= self.config.patient_access_threshold {
                let key = AlertKey {
                    action: actions::UNUSUAL_PATIENT_ACCESS_PATTERN,
                    actor_id: event.actor_id.clone(),
                    patient_id: Some(patient_id.clone()),
                };
                if self.claim_alert(key, now) {
                    alerts.push(
                        self.alert(
                            actions::UNUSUAL_PATIENT_ACCESS_PATTERN,
                            event,
                            format!(
                                "{} accessed patient {} {} times within {} minutes",
                                event.actor_id, patient_id, accesses, self.config.window_minutes
                            ),
                            json!({ "access_count": accesses }),
                        )
                        .with_patient_id(patient_id.clone()),
                    );
                }
            }
        }

        let addresses: HashSet<&str> = history
            .iter()
            .map(|e| e.event.ip_address.as_str())
            .filter(|ip| *ip != UNKNOWN)
            .collect();
        if addresses.len() >= self.config.distinct_ip_threshold {
            let key = AlertKey {
                action: actions::MULTIPLE_IP_ACCESS,
                actor_id: event.actor_id.clone(),
                patient_id: None,
            };
            if self.claim_alert(key, now) {
                let mut ips: Vec<&str> = addresses.into_iter().collect();
                ips.sort_unstable();
                alerts.push(self.alert(
                    actions::MULTIPLE_IP_ACCESS,
                    event,
                    format!(
                        "{} active from {} addresses within {} minutes",
                        event.actor_id,
                        ips.len(),
                        self.config.window_minutes
                    ),
                    json!({ "ip_addresses": ips }),
                ));
            }
        }

        Ok(alerts)
    }

    /// Returns false if the same alert already fired within the window
    fn claim_alert(&self, key: AlertKey, now: DateTime<Utc>) -> bool {
        let window = self.window();
        let mut recent = self
            .recent_alerts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        recent.retain(|_, fired_at| now - *fired_at < window);

        if recent.contains_key(&key) {
            return false;
        }
        recent.insert(key, now);
        true
    }

    fn alert(
        &self,
        action: &str,
        trigger: &AuditEvent,
        reason: String,
        mut details: serde_json::Value,
    ) -> NewAuditEvent {
        details["subject_actor_id"] = json!(trigger.actor_id);
        details["subject_actor_role"] = json!(trigger.actor_role);
        details["trigger_event_id"] = json!(trigger.event_id.to_string());
        details["window_minutes"] = json!(self.config.window_minutes);

        NewAuditEvent::system(action, Outcome::Warning)
            .with_resource_id(trigger.actor_id.clone())
            .with_origin(trigger.ip_address.clone(), trigger.user_agent.clone())
            .with_details(details)
            .with_reason(reason)
    }
}
