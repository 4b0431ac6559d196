//! HTTP server for run status.
//!
//! Provides endpoints for:
//! - Live progress of the current run
//! - History of finished runs
//! - Recently failed observations

use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use era5_prep::{Progress, ProgressSnapshot};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::ledger::{FailureRecord, OutcomeLedger, RunRecord};

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub service: String,
    pub status: String,
    pub instrument: String,
    pub started_at: String,
    pub progress: ProgressSnapshot,
    pub last_run: Option<RunRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunsResponse {
    pub runs: Vec<RunRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailuresResponse {
    pub failures: Vec<FailureRecord>,
}

// ============================================================================
// Query Parameters
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

// ============================================================================
// Shared State
// ============================================================================

pub struct ServerState {
    pub progress: Arc<Progress>,
    pub ledger: Arc<OutcomeLedger>,
    pub instrument: String,
    pub started_at: DateTime<Utc>,
}

// ============================================================================
// Router
// ============================================================================

/// Create the status API router.
pub fn create_router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(status_handler))
        .route("/runs", get(runs_handler))
        .route("/failures", get(failures_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(Extension(state))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /status - Progress of the current run
async fn status_handler(Extension(state): Extension<Arc<ServerState>>) -> impl IntoResponse {
    let progress = state.progress.snapshot();

    let last_run = match state.ledger.recent_runs(1).await {
        Ok(mut runs) => runs.pop(),
        Err(e) => return internal_error(e),
    };

    let status = if progress.total == 0 {
        "starting"
    } else if progress.done + progress.skipped + progress.failed + progress.cancelled
        >= progress.total
    {
        "finished"
    } else {
        "running"
    };

    let response = StatusResponse {
        service: "era5-downloader".to_string(),
        status: status.to_string(),
        instrument: state.instrument.clone(),
        started_at: state.started_at.to_rfc3339(),
        progress,
        last_run,
    };

    Json(response).into_response()
}

/// GET /runs - Finished runs, newest first
async fn runs_handler(
    Extension(state): Extension<Arc<ServerState>>,
    Query(params): Query<LimitQuery>,
) -> impl IntoResponse {
    match state.ledger.recent_runs(params.limit.unwrap_or(20)).await {
        Ok(runs) => Json(RunsResponse { runs }).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /failures - Failed observations, newest run first
async fn failures_handler(
    Extension(state): Extension<Arc<ServerState>>,
    Query(params): Query<LimitQuery>,
) -> impl IntoResponse {
    match state.ledger.recent_failures(params.limit.unwrap_or(50)).await {
        Ok(failures) => Json(FailuresResponse { failures }).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /health - Health check endpoint
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "era5-downloader"
    }))
}

fn internal_error(e: anyhow::Error) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}

/// Start the HTTP server.
pub async fn run_server(state: Arc<ServerState>, port: u16) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    info!(port = port, "Starting run status server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> Arc<ServerState> {
        Arc::new(ServerState {
            progress: Arc::new(Progress::new()),
            ledger: Arc::new(OutcomeLedger::open_memory().await.unwrap()),
            instrument: "CORAL".to_string(),
            started_at: Utc::now(),
        })
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_router(test_state().await);
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_reports_progress() {
        let state = test_state().await;
        state.progress.begin(3);

        let (status, body) = get_json(create_router(state), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert_eq!(body["instrument"], "CORAL");
        assert_eq!(body["progress"]["total"], 3);
        assert!(body["last_run"].is_null());
    }

    #[tokio::test]
    async fn test_runs_and_failures_empty() {
        let state = test_state().await;

        let (status, body) = get_json(create_router(state.clone()), "/runs?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["runs"].as_array().unwrap().len(), 0);

        let (status, body) = get_json(create_router(state), "/failures").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["failures"].as_array().unwrap().len(), 0);
    }
}
