// Queue delivery endpoints
//
// Both bodies carry an HMAC tag; the coordinator rejects a mismatch with
// 403 before touching the store. Any non-2xx answer makes the queue
// redeliver.

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use leaseflow_durable::{ResumeRequest, TimeoutRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::common::{body_error, coordinator_error, ApiError};
use crate::AppState;

/// Response of a delivered resume task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeResponse {
    /// Steps the workflow advanced
    pub steps: usize,
}

/// Create routes for queue deliveries
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/resume", post(resume))
        .route("/callback/timeout", post(timeout))
        .with_state(state)
}

/// POST /resume - Fallback resume task
pub async fn resume(
    State(state): State<AppState>,
    payload: Result<Json<ResumeRequest>, JsonRejection>,
) -> Result<Json<ResumeResponse>, ApiError> {
    let Json(request) = payload.map_err(body_error)?;
    let steps = state
        .coordinator
        .resume_callback(&request)
        .await
        .map_err(coordinator_error)?;
    Ok(Json(ResumeResponse { steps }))
}

/// POST /callback/timeout - Fired workflow deadline
pub async fn timeout(
    State(state): State<AppState>,
    payload: Result<Json<TimeoutRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload.map_err(body_error)?;
    let output = state
        .coordinator
        .timeout_callback(&request)
        .await
        .map_err(coordinator_error)?;
    Ok(Json(output))
}
