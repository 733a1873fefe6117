//! HTTP control plane: route table, handlers, and the API-key guard.

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::api_errors::ApiError;
use crate::api_models::{
    CleanupRequest, CleanupResponse, HealthResponse, MetricsQuery, QueueRequest, QueueResponse,
    QueueSnapshotResponse,
};
use crate::ledger::SqliteLedger;
use crate::models::{is_valid_commit_sha, CancelOutcome, ClaimOutcome, ReleaseState};
use crate::scheduler::Scheduler;

pub struct AppState {
    pub ledger: SqliteLedger,
    pub scheduler: Scheduler,
    pub default_cleanup_days: i64,
    pub api_key: Option<String>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/queue", post(queue_release).get(queue_snapshot))
        .route("/queue/:commit_sha", delete(cancel_release))
        .route("/release/:commit_sha", get(release_status))
        .route("/metrics", get(release_metrics))
        .route("/cleanup", post(run_cleanup))
        .route("/healthcheck", get(healthcheck))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .with_state(state)
}

/// When a key is configured, every route except the healthcheck requires a
/// matching `x-api-key` header.
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.api_key {
        if request.uri().path() != "/healthcheck" {
            let provided = request
                .headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok());
            if provided != Some(expected.as_str()) {
                return ApiError::Unauthorized.into_response();
            }
        }
    }
    next.run(request).await
}

async fn queue_release(
    State(state): State<Arc<AppState>>,
    body: Option<Json<QueueRequest>>,
) -> Result<Response, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or(QueueRequest {
        commit_sha: None,
        priority: None,
    });
    let commit_sha = body.commit_sha.unwrap_or_default();
    if commit_sha.is_empty() {
        return Err(ApiError::Validation("Commit SHA is required".to_string()));
    }
    if !is_valid_commit_sha(&commit_sha) {
        return Err(ApiError::Validation("Invalid commit SHA format".to_string()));
    }
    let priority = body.priority.unwrap_or(0);

    match state.ledger.claim(&commit_sha, priority, Utc::now())? {
        ClaimOutcome::Started => {
            info!(commit_sha, "claim accepted, launching immediately");
            state.scheduler.launch(commit_sha.clone()).await;
            Ok((
                StatusCode::OK,
                Json(QueueResponse {
                    state: ReleaseState::Running,
                    message: format!("Release queued for commit {}", commit_sha),
                }),
            )
                .into_response())
        }
        ClaimOutcome::Queued => {
            info!(commit_sha, priority, "claim accepted, queued");
            Ok((
                StatusCode::OK,
                Json(QueueResponse {
                    state: ReleaseState::Queued,
                    message: format!("Release queued for commit {}", commit_sha),
                }),
            )
                .into_response())
        }
        ClaimOutcome::AlreadyTracked(existing) => Ok((
            StatusCode::ACCEPTED,
            Json(QueueResponse {
                state: existing,
                message: format!(
                    "Release for commit {} exists with status {}",
                    commit_sha, existing
                ),
            }),
        )
            .into_response()),
    }
}

async fn cancel_release(
    State(state): State<Arc<AppState>>,
    Path(commit_sha): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !is_valid_commit_sha(&commit_sha) {
        return Err(ApiError::Validation("Invalid commit SHA format".to_string()));
    }
    match state.ledger.cancel(&commit_sha)? {
        CancelOutcome::Cancelled => {
            info!(commit_sha, "queued release cancelled");
            Ok(Json(json!({
                "message": format!("Release for commit {} removed from queue", commit_sha)
            })))
        }
        CancelOutcome::NotFound => Err(ApiError::NotFound("Release not found".to_string())),
        CancelOutcome::Conflict(actual) => Err(ApiError::Conflict {
            message: format!(
                "Release for commit {} is {} and cannot be cancelled",
                commit_sha, actual
            ),
            state: actual,
        }),
    }
}

async fn queue_snapshot(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueSnapshotResponse>, ApiError> {
    let queue = state.ledger.queue_snapshot()?;
    Ok(Json(QueueSnapshotResponse {
        is_running: state.ledger.is_release_running()?,
        queue_length: queue.len(),
        queue,
    }))
}

async fn release_status(
    State(state): State<Arc<AppState>>,
    Path(commit_sha): Path<String>,
) -> Result<Response, ApiError> {
    if !is_valid_commit_sha(&commit_sha) {
        return Err(ApiError::Validation("Invalid commit SHA format".to_string()));
    }
    match state.ledger.get(&commit_sha)? {
        Some(record) => Ok(Json(record).into_response()),
        None => Ok(Json(json!({})).into_response()),
    }
}

async fn release_metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<Vec<crate::models::StateMetrics>>, ApiError> {
    let days = query
        .days
        .as_deref()
        .and_then(|d| d.parse::<i64>().ok())
        .filter(|d| *d > 0)
        .ok_or_else(|| ApiError::Validation("Invalid days parameter".to_string()))?;
    Ok(Json(state.ledger.metrics_since(days, Utc::now())?))
}

async fn run_cleanup(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CleanupRequest>>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let days = body
        .and_then(|Json(b)| b.days)
        .unwrap_or(state.default_cleanup_days);
    let removed = state.ledger.purge_older_than(days, Utc::now())?;
    info!(removed, days, "cleanup pass complete");
    Ok(Json(CleanupResponse {
        removed,
        message: format!("Removed {} release records older than {} days", removed, days),
    }))
}

async fn healthcheck(State(state): State<Arc<AppState>>) -> Response {
    let status = state
        .ledger
        .is_release_running()
        .and_then(|running| Ok((running, state.ledger.queue_length()?)));
    match status {
        Ok((is_release_running, queue_length)) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "OK",
                is_release_running,
                queue_length,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "error": e.to_string() })),
        )
            .into_response(),
    }
}
