use axum::{
    body::Bytes,
    extract::{Extension, Json, Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    gateway::verify_callback_signature,
    middleware::AuthenticatedUser,
    orchestrator::{CallbackRequest, OrchestratorError, PrefillRequest, VideoGenerationRequest},
    state::AppState,
};

pub async fn health(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(error) => {
            tracing::error!(error = %error, "health check failed against the data store");
            (StatusCode::INTERNAL_SERVER_ERROR, "data store unreachable").into_response()
        }
    }
}

pub async fn start_video_generation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<VideoGenerationRequest>,
) -> Response {
    match state
        .orchestrator
        .run_video_generation(&user.user_id, request)
        .await
    {
        Ok(accepted) => (
            StatusCode::OK,
            Json(json!({ "success": true, "jobId": accepted.job_id })),
        )
            .into_response(),
        Err(error) => orchestrator_error_response(error, StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn start_prefill(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<PrefillRequest>,
) -> Response {
    match state.orchestrator.run_prefill(&user.user_id, request).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({ "jobId": outcome.job_id, "result": outcome.result })),
        )
            .into_response(),
        Err(error) => orchestrator_error_response(error, StatusCode::BAD_GATEWAY),
    }
}

pub async fn get_job(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.orchestrator.get_job(&user.user_id, id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Job not found" })),
        )
            .into_response(),
        Err(error) => {
            tracing::error!(error = %error, job_id = %id, "failed to load job");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal Server Error" })),
            )
                .into_response()
        }
    }
}

/// Completion callback from the generation service. Authenticated by the
/// HMAC signature over the raw body, so the body is read as bytes before
/// JSON decoding.
pub async fn job_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let secret = match state.config.webhook_callback_secret.as_deref() {
        Some(secret) if !secret.is_empty() => secret,
        _ => {
            tracing::warn!("callback received but WEBHOOK_CALLBACK_SECRET is not configured");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };

    let signature = match headers
        .get("x-signature")
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => value,
        None => return (StatusCode::UNAUTHORIZED, "Missing signature").into_response(),
    };

    if let Err(error) = verify_callback_signature(secret, signature, &body) {
        tracing::warn!(error = %error, "callback signature rejected");
        return (StatusCode::UNAUTHORIZED, "Invalid signature").into_response();
    }

    let request: CallbackRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid callback payload: {error}") })),
            )
                .into_response()
        }
    };

    match state.orchestrator.apply_callback(request).await {
        Ok(outcome) => {
            if !outcome.applied {
                tracing::info!(job_id = %outcome.job_id, "callback replay for terminal job ignored");
            }
            (StatusCode::OK, Json(json!({ "received": true }))).into_response()
        }
        Err(OrchestratorError::NotFound) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unknown job" })),
        )
            .into_response(),
        Err(OrchestratorError::InvalidRequest(message)) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
        }
        Err(error) => {
            tracing::error!(error = %error, "failed to apply callback");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal Server Error" })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StorageScanQuery {
    pub dry_run: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct StorageScanBody {
    #[serde(rename = "dryRun")]
    pub dry_run: Option<bool>,
}

pub async fn storage_scan_preview(
    State(state): State<AppState>,
    Query(query): Query<StorageScanQuery>,
) -> Response {
    run_storage_scan(&state, query.dry_run.unwrap_or(true)).await
}

/// POST accepts an optional `{"dryRun": bool}` body; anything absent or
/// unparseable falls back to a dry run.
pub async fn storage_scan(State(state): State<AppState>, body: Bytes) -> Response {
    let dry_run = serde_json::from_slice::<StorageScanBody>(&body)
        .ok()
        .and_then(|body| body.dry_run)
        .unwrap_or(true);
    run_storage_scan(&state, dry_run).await
}

async fn run_storage_scan(state: &AppState, dry_run: bool) -> Response {
    let reconciler = match state.reconciler.as_ref() {
        Some(reconciler) => reconciler,
        None => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "object storage is not configured" })),
            )
                .into_response()
        }
    };

    match reconciler.scan(dry_run).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(error) => {
            tracing::error!(error = %error, dry_run, "storage reconciliation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": error.to_string() })),
            )
                .into_response()
        }
    }
}

/// Maps orchestrator failures onto the route's contract. Upstream failures
/// carry the job id so clients can follow up; the status for those differs
/// per route (`upstream_status`).
fn orchestrator_error_response(error: OrchestratorError, upstream_status: StatusCode) -> Response {
    match error {
        OrchestratorError::InvalidRequest(message) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
        }
        OrchestratorError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Listing not found" })),
        )
            .into_response(),
        OrchestratorError::InsufficientCredits {
            available,
            requested,
        } => (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({
                "error": "Insufficient credits",
                "available": available,
                "requested": requested,
            })),
        )
            .into_response(),
        OrchestratorError::JobCreationFailed(message) => {
            tracing::error!(error = %message, "job creation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to create job" })),
            )
                .into_response()
        }
        OrchestratorError::Upstream { job_id, source } => {
            tracing::error!(error = %source, job_id = %job_id, "generation service call failed");
            (
                upstream_status,
                Json(json!({
                    "error": "Generation service is unavailable",
                    "jobId": job_id,
                })),
            )
                .into_response()
        }
        OrchestratorError::Persistence(message) => {
            tracing::error!(error = %message, "persistence failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal Server Error" })),
            )
                .into_response()
        }
        OrchestratorError::NotConfigured(what) => {
            tracing::error!(webhook = what, "webhook URL is not configured");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("{what} generation is not configured") })),
            )
                .into_response()
        }
    }
}
