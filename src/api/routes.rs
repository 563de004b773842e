use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::shadow::{MetricSummary, RateLimitStats, ShadowRuntime};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<ShadowRuntime>,
}

/// Create the API router
pub fn create_router(runtime: Arc<ShadowRuntime>) -> Router {
    let state = AppState { runtime };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/api/shadow/summaries", get(get_summaries))
        .route("/api/shadow/summaries/:name", get(get_summary))
        .route("/api/shadow/export", get(get_export))
        .route("/api/shadow/rate-limit", get(get_rate_limit))
        .route("/api/shadow/reset", post(reset_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        operations: state.runtime.metrics().names().len(),
    })
}

/// Prometheus text exposition
async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.runtime.metrics().to_prometheus(),
    )
}

/// All operation summaries, ordered by name
async fn get_summaries(State(state): State<AppState>) -> Json<SummariesResponse> {
    let summaries = state.runtime.metrics().get_all_summaries();
    Json(SummariesResponse {
        count: summaries.len(),
        summaries,
    })
}

async fn get_summary(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<MetricSummary>, ApiError> {
    state
        .runtime
        .metrics()
        .get_summary(&name)
        .map(Json)
        .ok_or(ApiError::NotFound(format!("No shadow metrics for {}", name)))
}

/// Full export document, byte-for-byte what the file export writes
async fn get_export(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let document = state.runtime.metrics().export_metrics(None)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], document))
}

async fn get_rate_limit(State(state): State<AppState>) -> Json<RateLimitStats> {
    Json(state.runtime.telemetry().get_rate_limit_stats())
}

/// Clear one operation (`?name=`) or every operation
async fn reset_metrics(
    State(state): State<AppState>,
    Query(params): Query<ResetQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(name) = params.name.as_deref() {
        if name.trim().is_empty() {
            return Err(ApiError::BadRequest("name must not be empty".to_string()));
        }
    }

    state.runtime.metrics().reset(params.name.as_deref());
    let scope = params.name.unwrap_or_else(|| "all".to_string());
    info!(scope = %scope, "Shadow metrics reset");

    Ok(Json(json!({ "reset": scope })))
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct ResetQuery {
    /// Operation to clear; all operations when omitted
    name: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    operations: usize,
}

#[derive(Serialize)]
struct SummariesResponse {
    count: usize,
    summaries: Vec<MetricSummary>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    Internal(anyhow::Error),
    NotFound(String),
    BadRequest(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Internal(err) => {
                tracing::error!("Shadow API error: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
