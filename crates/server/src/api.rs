//! Internal approval API.
//!
//! - `POST /api/v1/approvals`                         register an approvable entity
//! - `GET  /api/v1/approvals/stats`                   ledger statistics
//! - `GET  /api/v1/approvals/{entity_id}`             current entity and status
//! - `POST /api/v1/approvals/{entity_id}/actions`     run an approval action
//! - `GET  /api/v1/approvals/{entity_id}/history`     ordered approval records
//! - `POST /api/v1/approvals/{entity_id}/repair`      re-derive status from the ledger

use std::sync::Arc;

use accord_core::approvals::{ApprovalEngine, ExecutionOutcome, LedgerStatistics, RepairOutcome};
use accord_core::domain::approval::{
    ApprovalAction, ApprovalChannel, ApprovalOperation, ApprovalRecord,
};
use accord_core::domain::entity::{ApprovableEntity, EntityId, EntitySnapshot};
use accord_core::errors::{ApplicationError, InterfaceError};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    engine: Arc<ApprovalEngine>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub entity_id: String,
    pub snapshot: EntitySnapshot,
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub action: ApprovalAction,
    pub operator_id: String,
    /// `internal` or `api`; external decisions only arrive through the verified webhook.
    #[serde(default)]
    pub channel: Option<ApprovalChannel>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Cycle the caller was looking at; stale cycles are refused.
    #[serde(default)]
    pub cycle_sequence: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub correlation_id: String,
    pub retryable: bool,
}

pub struct ApiError {
    interface: InterfaceError,
    retryable: bool,
}

impl ApiError {
    fn from_application(error: ApplicationError, correlation_id: &str) -> Self {
        let retryable = error.is_retryable();
        warn!(
            event_name = "api.request.failed",
            correlation_id,
            error_class = error.error_class(),
            error = %error,
            "approval API request failed"
        );
        Self { interface: error.into_interface(correlation_id), retryable }
    }

    fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self {
            interface: InterfaceError::BadRequest {
                message: message.into(),
                correlation_id: correlation_id.to_string(),
            },
            retryable: false,
        }
    }

    fn conflict(message: impl Into<String>, correlation_id: &str) -> Self {
        Self {
            interface: InterfaceError::Conflict {
                message: message.into(),
                correlation_id: correlation_id.to_string(),
            },
            retryable: false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self.interface {
            InterfaceError::BadRequest { message, .. } => (StatusCode::BAD_REQUEST, Some(message)),
            InterfaceError::Forbidden { message, .. } => (StatusCode::FORBIDDEN, Some(message)),
            InterfaceError::NotFound { message, .. } => (StatusCode::NOT_FOUND, Some(message)),
            InterfaceError::Conflict { message, .. } => (StatusCode::CONFLICT, Some(message)),
            InterfaceError::ServiceUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, None),
            InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        let body = ErrorBody {
            error: self.interface.user_message().to_string(),
            detail: detail.cloned(),
            correlation_id: self.interface.correlation_id().to_string(),
            retryable: self.retryable,
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(engine: Arc<ApprovalEngine>) -> Router {
    Router::new()
        .route("/api/v1/approvals", post(register))
        .route("/api/v1/approvals/stats", get(statistics))
        .route("/api/v1/approvals/{entity_id}", get(current))
        .route("/api/v1/approvals/{entity_id}/actions", post(execute))
        .route("/api/v1/approvals/{entity_id}/history", get(history))
        .route("/api/v1/approvals/{entity_id}/repair", post(repair))
        .with_state(ApiState { engine })
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req-{}", Uuid::new_v4().simple()))
}

async fn register(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<ApprovableEntity>), ApiError> {
    let correlation_id = correlation_id(&headers);
    let entity_id = body.entity_id.trim();
    if entity_id.is_empty() {
        return Err(ApiError::bad_request("entity_id is required", &correlation_id));
    }
    let entity_id = EntityId::new(entity_id);

    match state.engine.entity(&entity_id).await {
        Ok(_) => {
            return Err(ApiError::conflict(
                format!("entity {entity_id} is already registered"),
                &correlation_id,
            ));
        }
        Err(ApplicationError::EntityNotFound(_)) => {}
        Err(error) => return Err(ApiError::from_application(error, &correlation_id)),
    }

    let entity = ApprovableEntity::new(entity_id, body.snapshot);
    state
        .engine
        .register(entity.clone())
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok((StatusCode::CREATED, Json(entity)))
}

async fn execute(
    State(state): State<ApiState>,
    Path(entity_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ActionRequest>,
) -> Result<Json<ExecutionOutcome>, ApiError> {
    let correlation_id = correlation_id(&headers);
    if body.operator_id.trim().is_empty() {
        return Err(ApiError::bad_request("operator_id is required", &correlation_id));
    }
    let channel = body.channel.unwrap_or(ApprovalChannel::Api);
    if channel == ApprovalChannel::External {
        return Err(ApiError::bad_request(
            "channel `external` is reserved for platform callbacks",
            &correlation_id,
        ));
    }

    let mut operation = ApprovalOperation::new(
        EntityId::new(entity_id),
        body.action,
        body.operator_id.trim(),
        channel,
    )
    .with_metadata("correlation_id", correlation_id.clone());
    if let Some(comment) = body.comment {
        operation = operation.with_comment(comment);
    }
    if let Some(reason) = body.reason {
        operation = operation.with_reason(reason);
    }
    if let Some(cycle_sequence) = body.cycle_sequence {
        operation = operation.for_cycle(cycle_sequence);
    }

    state
        .engine
        .execute(operation)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_application(error, &correlation_id))
}

async fn current(
    State(state): State<ApiState>,
    Path(entity_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ApprovableEntity>, ApiError> {
    let correlation_id = correlation_id(&headers);
    state
        .engine
        .entity(&EntityId::new(entity_id))
        .await
        .map(Json)
        .map_err(|error| ApiError::from_application(error, &correlation_id))
}

async fn history(
    State(state): State<ApiState>,
    Path(entity_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<ApprovalRecord>>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let entity_id = EntityId::new(entity_id);
    // An unknown entity is a 404, not an empty history.
    state
        .engine
        .entity(&entity_id)
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    state
        .engine
        .history(&entity_id)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_application(error, &correlation_id))
}

async fn repair(
    State(state): State<ApiState>,
    Path(entity_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RepairOutcome>, ApiError> {
    let correlation_id = correlation_id(&headers);
    state
        .engine
        .repair(&EntityId::new(entity_id))
        .await
        .map(Json)
        .map_err(|error| ApiError::from_application(error, &correlation_id))
}

async fn statistics(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<LedgerStatistics>, ApiError> {
    let correlation_id = correlation_id(&headers);
    state
        .engine
        .statistics()
        .await
        .map(Json)
        .map_err(|error| ApiError::from_application(error, &correlation_id))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use accord_core::approvals::{ApprovalEngine, ProviderSet};
    use accord_core::store::InMemoryApprovalStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{router, CORRELATION_HEADER};

    fn app() -> Router {
        let engine = ApprovalEngine::new(
            Arc::new(InMemoryApprovalStore::default()),
            ProviderSet::internal_only(),
        );
        router(Arc::new(engine))
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header(CORRELATION_HEADER, "req-test")
            .body(body.map_or_else(Body::empty, |body| Body::from(body.to_string())))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    async fn registered(app: &Router, entity_id: &str) {
        let (status, _) = call(
            app,
            Method::POST,
            "/api/v1/approvals",
            Some(json!({
                "entity_id": entity_id,
                "snapshot": {
                    "title": "Acme renewal",
                    "fields": [
                        { "label": "Total", "value": { "kind": "money", "amount": "1200.50",
                                                       "currency": "EUR" } }
                    ]
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    fn action(action: &str, operator: &str) -> Option<Value> {
        Some(json!({ "action": action, "operator_id": operator }))
    }

    #[tokio::test]
    async fn reject_resubmit_approve_is_visible_through_history() {
        let app = app();
        registered(&app, "Q-API-1").await;

        let actions = "/api/v1/approvals/Q-API-1/actions";
        let (status, body) = call(&app, Method::POST, actions, action("submit", "alice")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["new_status"], "pending");

        let reject = Some(json!({
            "action": "reject", "operator_id": "bob", "reason": "price too high"
        }));
        let (status, _) = call(&app, Method::POST, actions, reject).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, Method::POST, actions, action("resubmit", "alice")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cycle_sequence"], 2);
        call(&app, Method::POST, actions, action("approve", "bob")).await;

        let (status, history) =
            call(&app, Method::GET, "/api/v1/approvals/Q-API-1/history", None).await;
        assert_eq!(status, StatusCode::OK);
        let kinds: Vec<&str> = history
            .as_array()
            .expect("history array")
            .iter()
            .filter_map(|record| record["action"].as_str())
            .collect();
        assert_eq!(kinds, vec!["submit", "reject", "resubmit", "approve"]);

        let (_, current) = call(&app, Method::GET, "/api/v1/approvals/Q-API-1", None).await;
        assert_eq!(current["approval_status"], "approved");
        assert_eq!(current["business_status"], "approved");
    }

    #[tokio::test]
    async fn errors_map_to_http_statuses_with_correlation_id() {
        let app = app();
        registered(&app, "Q-API-2").await;
        let actions = "/api/v1/approvals/Q-API-2/actions";

        let (status, body) = call(&app, Method::POST, actions, action("approve", "bob")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["correlation_id"], "req-test");
        assert_eq!(body["retryable"], false);

        call(&app, Method::POST, actions, action("submit", "alice")).await;
        let (status, _) = call(&app, Method::POST, actions, action("withdraw", "mallory")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        call(&app, Method::POST, actions, action("approve", "bob")).await;
        let (status, _) = call(&app, Method::POST, actions, action("reject", "carol")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, Method::GET, "/api/v1/approvals/Q-NOPE/history", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn callers_cannot_claim_the_external_channel() {
        let app = app();
        registered(&app, "Q-API-5").await;
        let actions = "/api/v1/approvals/Q-API-5/actions";
        call(&app, Method::POST, actions, action("submit", "alice")).await;

        let spoofed = Some(json!({
            "action": "withdraw", "operator_id": "mallory", "channel": "external"
        }));
        let (status, body) = call(&app, Method::POST, actions, spoofed).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["correlation_id"], "req-test");

        let (_, current) = call(&app, Method::GET, "/api/v1/approvals/Q-API-5", None).await;
        assert_eq!(current["approval_status"], "pending");

        let internal = Some(json!({
            "action": "withdraw", "operator_id": "mallory", "channel": "internal"
        }));
        let (status, _) = call(&app, Method::POST, actions, internal).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let app = app();
        registered(&app, "Q-API-3").await;

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/v1/approvals",
            Some(json!({ "entity_id": "Q-API-3", "snapshot": { "title": "again", "fields": [] } })),
        )
        .await;

        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn statistics_and_repair_are_served() {
        let app = app();
        registered(&app, "Q-API-4").await;
        call(&app, Method::POST, "/api/v1/approvals/Q-API-4/actions", action("submit", "alice"))
            .await;

        let (status, stats) = call(&app, Method::GET, "/api/v1/approvals/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total_records"], 1);
        assert_eq!(stats["by_action"]["submit"], 1);

        let (status, outcome) =
            call(&app, Method::POST, "/api/v1/approvals/Q-API-4/repair", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["outcome"], "consistent");
        assert_eq!(outcome["status"], "pending");
    }
}
