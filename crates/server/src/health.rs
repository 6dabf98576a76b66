use std::sync::Arc;

use accord_core::approvals::ApprovalEngine;
use accord_db::DbPool;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    engine: Arc<ApprovalEngine>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    /// Absent when no external provider is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_provider: Option<HealthCheck>,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, engine: Arc<ApprovalEngine>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, engine })
}

/// Database failure makes the service unavailable; an unreachable platform only
/// degrades it, since submissions fall back to the internal provider.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let external_provider = match state.engine.providers().external() {
        Some(provider) if provider.is_available().await => Some(HealthCheck {
            status: "ready",
            detail: "platform reachable".to_string(),
        }),
        Some(_) => Some(HealthCheck {
            status: "degraded",
            detail: "platform unreachable; using internal provider".to_string(),
        }),
        None => None,
    };

    let database_ready = database.status == "ready";
    let external_ready = external_provider.as_ref().map_or(true, |check| check.status == "ready");
    let payload = HealthResponse {
        status: if database_ready && external_ready { "ready" } else { "degraded" },
        database,
        external_provider,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if database_ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}
