use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use crate::AppState;
use crate::redaction::{redact_value, RedactionLevel};
use crate::types::ProjectId;

const ADMIN_FRAGMENT_LIMIT: i64 = 20;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub database: String,
    pub providers: Vec<&'static str>,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let mut db_ok = true;

    if let Err(e) = state.store.ping().await {
        tracing::error!("Readiness check: DB error: {}", e);
        db_ok = false;
    }

    let providers = state.credentials.configured();
    if providers.is_empty() {
        tracing::error!("Readiness check: no provider credentials configured");
    }

    let ready = db_ok && !providers.is_empty();
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "unready" }.to_string(),
            database: if db_ok { "ok" } else { "error" }.to_string(),
            providers,
        }),
    )
}

pub async fn admin_fragments(
    State(state): State<Arc<AppState>>,
    axum::extract::ConnectInfo(addr): axum::extract::ConnectInfo<std::net::SocketAddr>,
    Path(project_id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    // Local only
    let ip = addr.ip();
    if !ip.is_loopback() {
        tracing::warn!("Blocked admin access attempt from {}", ip);
        return (StatusCode::FORBIDDEN, Json(serde_json::json!({ "error": "Unauthorized" })));
    }

    let project = ProjectId(project_id);
    let fragments = match state.store.latest_fragments(&project, ADMIN_FRAGMENT_LIMIT).await {
        Ok(f) => f,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": format!("DB Error: {}", e) })),
            );
        }
    };

    if fragments.is_empty() {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "Project not found" })));
    }

    let mut response = serde_json::json!({
        "project_id": project.0,
        "fragment_count": fragments.len(),
        "fragments": fragments,
    });

    redact_value(&mut response, RedactionLevel::Strict);

    (StatusCode::OK, Json(response))
}

pub async fn debug_providers(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let metrics = state.metrics.get_all_metrics().await;
    let breakers = state.breakers.snapshot().await;
    Json(serde_json::json!({
        "configured": state.credentials.configured(),
        "metrics": metrics,
        "breakers": breakers,
    }))
}
