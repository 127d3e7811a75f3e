//! HTTP surface
//!
//! Thin axum handlers over [`AuditService`]. Identity comes from the
//! `x-actor-id` / `x-actor-role` headers set by the upstream gateway.

use axum::{
    async_trait,
    extract::{FromRequestParts, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::audit::event::{actors, resources, roles, NewAuditEvent, Outcome};
use crate::error::AuditError;
use crate::service::{AuditService, RequestContext};

pub fn router(service: AuditService) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/audit/events", post(record_event))
        .route("/audit/access-check", post(access_check))
        .route("/audit/reports", get(compliance_report))
        .route("/audit/verify", get(verify_ledger))
        .route("/audit/integrity/clear", post(clear_integrity_hold))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(service)
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        // First hop of x-forwarded-for is the client
        let ip_address = header("x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
            .filter(|ip| !ip.is_empty());

        Ok(RequestContext {
            actor_id: header("x-actor-id").unwrap_or_else(|| actors::ANONYMOUS.to_string()),
            actor_role: header("x-actor-role")
                .map(|r| r.to_ascii_uppercase())
                .unwrap_or_else(|| roles::UNKNOWN.to_string()),
            ip_address,
            user_agent: header("user-agent"),
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
        })
    }
}

impl IntoResponse for AuditError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuditError::AccessDenied(_) => StatusCode::FORBIDDEN,
            AuditError::ValidationError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn health_check(State(service): State<AuditService>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "hospital-audit",
        "timestamp": Utc::now(),
        "queued_events": service.queue().len(),
        "dropped_events": service.queue().dropped_count(),
        "escalated_events": service.queue().escalation_count(),
    }))
}

/// Body of `POST /audit/events`. Identity is not part of it; the caller
/// is whoever the gateway headers say it is.
#[derive(Debug, Deserialize)]
struct RecordEventRequest {
    action: String,
    resource: String,
    #[serde(default)]
    resource_id: Option<String>,
    #[serde(default)]
    patient_id: Option<String>,
    #[serde(default)]
    details: Option<Value>,
    outcome: Outcome,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    ip_address: Option<String>,
    #[serde(default)]
    user_agent: Option<String>,
}

impl RecordEventRequest {
    fn into_event(self, ctx: &RequestContext) -> NewAuditEvent {
        let mut event = NewAuditEvent::new(
            ctx.actor_id.as_str(),
            ctx.actor_role.as_str(),
            self.action,
            self.resource,
            self.outcome,
        );
        event.resource_id = self.resource_id;
        event.patient_id = self.patient_id;
        event.details = self.details;
        event.reason = self.reason;
        event.ip_address = self.ip_address;
        event.user_agent = self.user_agent;
        event
    }
}

async fn record_event(
    State(service): State<AuditService>,
    ctx: RequestContext,
    Json(request): Json<RecordEventRequest>,
) -> Result<(StatusCode, Json<Value>), AuditError> {
    if request.action.trim().is_empty() || request.resource.trim().is_empty() {
        return Err(AuditError::ValidationError(
            "action and resource are required".to_string(),
        ));
    }

    let event = request.into_event(&ctx);
    let accepted = service.record_request_event(&ctx, event)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "event_id": accepted.event_id,
            "risk_level": accepted.risk_level,
            "timestamp": accepted.timestamp,
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct AccessCheckRequest {
    resource_category: String,
}

async fn access_check(
    State(service): State<AuditService>,
    ctx: RequestContext,
    Json(request): Json<AccessCheckRequest>,
) -> Result<Json<Value>, AuditError> {
    service.authorize(&ctx, &request.resource_category)?;
    Ok(Json(json!({
        "allowed": true,
        "actor_role": ctx.actor_role,
        "resource_category": request.resource_category,
        "categories": service.policy().categories_for(&ctx.actor_role),
    })))
}

#[derive(Debug, Deserialize)]
struct ReportQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

async fn compliance_report(
    State(service): State<AuditService>,
    ctx: RequestContext,
    Query(query): Query<ReportQuery>,
) -> Result<Response, AuditError> {
    service.authorize(&ctx, resources::AUDIT)?;

    let end = query.end.unwrap_or_else(Utc::now);
    let start = query
        .start
        .unwrap_or_else(|| end - Duration::days(service.config().compliance.report_window_days));
    let report = service.generate_compliance_report(start, end).await?;
    Ok(Json(report).into_response())
}

async fn verify_ledger(
    State(service): State<AuditService>,
    ctx: RequestContext,
) -> Result<Response, AuditError> {
    service.authorize(&ctx, resources::AUDIT)?;

    let result = service.verify_ledger().await?;
    let status = if result.is_valid {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(result)).into_response())
}

async fn clear_integrity_hold(
    State(service): State<AuditService>,
    ctx: RequestContext,
) -> Result<Json<Value>, AuditError> {
    service.authorize(&ctx, resources::AUDIT)?;

    let cleared = service.clear_integrity_hold(&ctx.actor_id).await?;
    Ok(Json(json!({ "cleared": cleared, "cleared_by": ctx.actor_id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessPolicy;
    use crate::config::AppConfig;
    use crate::database::{AuditStore, MemoryStore};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> (Arc<MemoryStore>, AuditService, Router) {
        let store = Arc::new(MemoryStore::new());
        let service = AuditService::new(store.clone(), &AppConfig::default(), AccessPolicy::default());
        (store, service.clone(), router(service))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_store, _service, app) = app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    fn post_event(actor_id: &str, role: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/audit/events")
            .header("content-type", "application/json")
            .header("x-actor-id", actor_id)
            .header("x-actor-role", role)
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .header("user-agent", "ehr-client/2.1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_record_event_fills_origin_from_headers() {
        let (store, service, app) = app();
        let body = json!({
            "action": "PATIENT_EXPORT",
            "resource": "patient_data",
            "patient_id": "p-1",
            "outcome": "SUCCESS"
        });
        let response = app.oneshot(post_event("dr-1", "doctor", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["risk_level"], "HIGH");

        service.flush().await.unwrap();
        let entries = store.all_entries().await.unwrap();
        assert_eq!(entries[0].event.actor_id, "dr-1");
        assert_eq!(entries[0].event.actor_role, "DOCTOR");
        assert_eq!(entries[0].event.ip_address, "203.0.113.7");
        assert_eq!(entries[0].event.user_agent, "ehr-client/2.1");
    }

    #[tokio::test]
    async fn test_body_identity_cannot_override_headers() {
        let (store, service, app) = app();
        let body = json!({
            "actor_id": "system",
            "actor_role": "SYSTEM",
            "action": "AUTH_FAILED_LOGIN",
            "resource": "authentication",
            "outcome": "FAILURE"
        });
        for _ in 0..6 {
            let response = app
                .clone()
                .oneshot(post_event("u1", "PATIENT", body.clone()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }
        service.flush().await.unwrap();

        let entries = store.all_entries().await.unwrap();
        let logins: Vec<_> = entries
            .iter()
            .filter(|e| e.event.action == "AUTH_FAILED_LOGIN")
            .collect();
        assert_eq!(logins.len(), 6);
        assert!(logins.iter().all(|e| e.event.actor_id == "u1"));
        assert!(logins.iter().all(|e| e.event.actor_role == "PATIENT"));

        let alerts = entries
            .iter()
            .filter(|e| e.event.action == "SUSPICIOUS_LOGIN_ATTEMPTS")
            .count();
        assert_eq!(alerts, 1);
    }

    #[tokio::test]
    async fn test_reserved_actions_need_system_role() {
        let (store, service, app) = app();
        let body = json!({
            "action": "SYSTEM_RETENTION_CLEANUP",
            "resource": "audit",
            "details": {"checkpoint_head": "sha256:00"},
            "outcome": "SUCCESS"
        });

        let denied = app
            .clone()
            .oneshot(post_event("nurse-1", "NURSE", body.clone()))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let alert = json!({
            "action": "SUSPICIOUS_LOGIN_ATTEMPTS",
            "resource": "authentication",
            "outcome": "SUCCESS"
        });
        let denied = app
            .clone()
            .oneshot(post_event("nurse-1", "NURSE", alert))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let impersonated = json!({
            "action": "PATIENT_VIEW",
            "resource": "patient_data",
            "outcome": "SUCCESS"
        });
        let denied = app
            .clone()
            .oneshot(post_event("system", "ADMIN", impersonated))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let allowed = app.oneshot(post_event("system", "SYSTEM", body)).await.unwrap();
        assert_eq!(allowed.status(), StatusCode::ACCEPTED);

        service.flush().await.unwrap();
        let entries = store.all_entries().await.unwrap();
        let denials: Vec<_> = entries
            .iter()
            .filter(|e| e.event.action == "ACCESS_DENIED")
            .collect();
        assert_eq!(denials.len(), 3);
        assert_eq!(denials[0].event.actor_id, "nurse-1");
        assert_eq!(denials[0].event.details.as_ref().unwrap()["path"], "/audit/events");
        let cleanups = entries
            .iter()
            .filter(|e| e.event.action == "SYSTEM_RETENTION_CLEANUP")
            .count();
        assert_eq!(cleanups, 1);
    }

    #[tokio::test]
    async fn test_access_check_lists_role_categories() {
        let (_store, _service, app) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/audit/access-check")
                    .header("content-type", "application/json")
                    .header("x-actor-id", "pt-1")
                    .header("x-actor-role", "patient")
                    .body(Body::from(json!({"resource_category": "appointments"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["allowed"], true);
        assert_eq!(body["categories"], json!(["appointments"]));
    }

    #[tokio::test]
    async fn test_access_check_denied_is_403_and_audited() {
        let (store, service, app) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/audit/access-check")
                    .header("content-type", "application/json")
                    .header("x-actor-id", "rec-1")
                    .header("x-actor-role", "receptionist")
                    .body(Body::from(json!({"resource_category": "medical_records"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        service.flush().await.unwrap();
        let entries = store.all_entries().await.unwrap();
        assert_eq!(entries[0].event.action, "ACCESS_DENIED");
        assert_eq!(entries[0].event.actor_id, "rec-1");
        assert_eq!(entries[0].event.details.as_ref().unwrap()["path"], "/audit/access-check");
    }

    #[tokio::test]
    async fn test_verify_requires_audit_access() {
        let (_store, _service, app) = app();
        let request = |role: &str| {
            Request::builder()
                .uri("/audit/verify")
                .header("x-actor-id", "someone")
                .header("x-actor-role", role)
                .body(Body::empty())
                .unwrap()
        };

        let denied = app.clone().oneshot(request("NURSE")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let allowed = app.oneshot(request("ADMIN")).await.unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
        assert_eq!(body_json(allowed).await["is_valid"], true);
    }

    #[tokio::test]
    async fn test_report_rejects_inverted_range() {
        let (_store, _service, app) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/audit/reports?start=2026-02-01T00:00:00Z&end=2026-01-01T00:00:00Z")
                    .header("x-actor-role", "ADMIN")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
