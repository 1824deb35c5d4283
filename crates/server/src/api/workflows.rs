// Workflow instance HTTP routes
//
// Instances are addressed as /wf/{name}/{id}. Only creation interprets
// `name`; reads and events route by id alone.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use leaseflow_durable::WorkflowInstance;
use serde_json::Value;

use super::common::{coordinator_error, ApiError, ErrorResponse};
use crate::AppState;

/// Create routes for workflow instances
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/wf/:name/:id", post(create_workflow).get(get_workflow))
        .route("/wf/:name/:id/:event", post(send_event))
        .with_state(state)
}

/// POST /wf/{name}/{id} - Create an instance and run it to its first wait
pub async fn create_workflow(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<WorkflowInstance>), ApiError> {
    let coordinator = &state.coordinator;
    coordinator
        .create(&id, &name)
        .await
        .map_err(coordinator_error)?;

    // The instance exists from here on; a failed resume is reported but
    // leaves it in place for the next event or callback to advance
    coordinator.resume(&id).await.map_err(coordinator_error)?;

    let instance = coordinator.get(&id).await.map_err(coordinator_error)?;
    Ok((StatusCode::CREATED, Json(instance)))
}

/// GET /wf/{name}/{id} - Latest snapshot of an instance
pub async fn get_workflow(
    State(state): State<AppState>,
    Path((_name, id)): Path<(String, String)>,
) -> Result<Json<WorkflowInstance>, ApiError> {
    let instance = state
        .coordinator
        .get(&id)
        .await
        .map_err(coordinator_error)?;
    Ok(Json(instance))
}

/// POST /wf/{name}/{id}/{event} - Deliver an external event
///
/// The body is passed to the workflow as-is; an empty body is `null`.
pub async fn send_event(
    State(state): State<AppState>,
    Path((_name, id, event)): Path<(String, String, String)>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let input = parse_input(&body)?;
    let coordinator = &state.coordinator;

    let output = coordinator
        .handle_event(&id, &event, input)
        .await
        .map_err(coordinator_error)?;

    // The event is committed; the fallback resume task covers a failure here
    if let Err(e) = coordinator.resume(&id).await {
        tracing::warn!(workflow_id = %id, event = %event, error = %e, "inline resume after event failed");
    }

    Ok(Json(output))
}

fn parse_input(body: &[u8]) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| {
        ErrorResponse::new(format!("invalid JSON body: {}", e)).into_response(StatusCode::BAD_REQUEST)
    })
}
