//! Job endpoint handlers.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use scanq_tasks::types::wire::{JobStatusResponse, SubmitJobRequest, SubmitJobResponse};
use scanq_tasks::{ServiceStats, TaskId};

use super::error::ApiError;
use super::AppState;

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `POST /jobs`
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let task_id = state.service.submit(request.modules).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse::accepted(task_id)),
    ))
}

/// `GET /jobs/{task_id}`
pub async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let response = state
        .service
        .status_response(&TaskId::from(task_id))
        .await?;
    Ok(Json(response))
}

/// `GET /jobs/{task_id}/result`
///
/// `200` with the results, `202` while running, `409` if the task failed.
pub async fn job_result(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task_id = TaskId::from(task_id);
    let result = state.service.get_result(&task_id).await?;
    Ok(Json(json!({ "task_id": task_id, "result": result })))
}

/// `POST /jobs/{task_id}/cancel`
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let record = state.service.cancel(&TaskId::from(task_id)).await?;
    Ok(Json(JobStatusResponse::from(&record)))
}

/// `GET /jobs/stats`
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<ServiceStats>, ApiError> {
    Ok(Json(state.service.stats().await?))
}
