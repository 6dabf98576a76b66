//! Platform callback endpoint.
//!
//! `GET /webhooks/eemp` answers the URL verification handshake; `POST` receives
//! encrypted event deliveries. A delivery is acknowledged with the literal
//! `success` body only after the report has been applied, so the platform keeps
//! retrying anything that failed.

use std::sync::Arc;
use std::time::Duration;

use accord_core::approvals::SyncService;
use accord_core::errors::ApplicationError;
use accord_eemp::callback::ACK_BODY;
use accord_eemp::{
    CallbackEnvelope, CallbackError, CallbackEvent, CallbackHandler, CallbackQuery,
};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tracing::{debug, error, info, warn};

pub const WEBHOOK_PATH: &str = "/webhooks/eemp";

#[derive(Clone)]
pub struct WebhookState {
    callbacks: Arc<CallbackHandler>,
    sync: Arc<SyncService>,
    timeout: Duration,
}

pub fn router(
    callbacks: Arc<CallbackHandler>,
    sync: Arc<SyncService>,
    timeout: Duration,
) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, get(verify).post(receive))
        .with_state(WebhookState { callbacks, sync, timeout })
}

fn rejection(error: &CallbackError) -> StatusCode {
    if error.is_signature_failure() {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::BAD_REQUEST
    }
}

async fn verify(
    State(state): State<WebhookState>,
    Query(query): Query<CallbackQuery>,
) -> (StatusCode, String) {
    match state.callbacks.handshake(&query) {
        Ok(challenge) => {
            info!(
                event_name = "webhook.verify.accepted",
                timestamp = %query.timestamp,
                "callback URL verification answered"
            );
            (StatusCode::OK, challenge)
        }
        Err(error) => {
            warn!(
                event_name = "webhook.verify.rejected",
                security = true,
                error = %error,
                "callback URL verification refused"
            );
            (rejection(&error), String::new())
        }
    }
}

async fn receive(
    State(state): State<WebhookState>,
    Query(query): Query<CallbackQuery>,
    Json(envelope): Json<CallbackEnvelope>,
) -> (StatusCode, String) {
    let event = match state.callbacks.open_event(&query, &envelope) {
        Ok(event) => event,
        Err(error) => {
            warn!(
                event_name = "webhook.event.rejected",
                security = error.is_signature_failure(),
                error = %error,
                "callback delivery refused"
            );
            return (rejection(&error), String::new());
        }
    };

    let report = match event {
        CallbackEvent::InstanceChange(report) => report,
        CallbackEvent::CheckUrl => return (StatusCode::OK, ACK_BODY.to_string()),
        CallbackEvent::Ignored { event_type } => {
            debug!(
                event_name = "webhook.event.ignored",
                event_type = %event_type,
                "callback event ignored"
            );
            return (StatusCode::OK, ACK_BODY.to_string());
        }
    };

    let reference_id = report.reference_id.clone();
    match tokio::time::timeout(state.timeout, state.sync.sync_from_external(report)).await {
        Ok(Ok(outcome)) => {
            info!(
                event_name = "webhook.event.processed",
                reference_id = %reference_id,
                outcome = ?outcome,
                "callback delivery processed"
            );
            (StatusCode::OK, ACK_BODY.to_string())
        }
        Ok(Err(ApplicationError::UnknownReference(_))) => {
            warn!(
                event_name = "webhook.event.unknown_reference",
                reference_id = %reference_id,
                "callback refers to an instance this service did not open"
            );
            (StatusCode::OK, ACK_BODY.to_string())
        }
        Ok(Err(failure)) => {
            error!(
                event_name = "webhook.event.failed",
                reference_id = %reference_id,
                error_class = failure.error_class(),
                error = %failure,
                "callback delivery could not be applied"
            );
            (StatusCode::SERVICE_UNAVAILABLE, String::new())
        }
        Err(_) => {
            error!(
                event_name = "webhook.event.timeout",
                reference_id = %reference_id,
                timeout_secs = state.timeout.as_secs(),
                "callback delivery timed out"
            );
            (StatusCode::SERVICE_UNAVAILABLE, String::new())
        }
    }
}
