//! Mapping of engine errors to HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use scanq_tasks::types::wire::FailureInfo;
use scanq_tasks::TaskError;

/// Error returned by every handler.
#[derive(Debug)]
pub enum ApiError {
    /// The request body could not be decoded.
    BadRequest(String),
    /// An engine error.
    Task(TaskError),
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        Self::Task(err)
    }
}

impl ApiError {
    /// Status code for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Task(err) => match err {
                TaskError::InvalidSpec { .. } => StatusCode::BAD_REQUEST,
                TaskError::NotFound { .. } => StatusCode::NOT_FOUND,
                TaskError::NotReady { .. } => StatusCode::ACCEPTED,
                TaskError::InvalidTransition { .. }
                | TaskError::TaskFailed { .. }
                | TaskError::LeaseLost { .. } => StatusCode::CONFLICT,
                TaskError::ConcurrentModification { .. }
                | TaskError::StoreUnavailable(_)
                | TaskError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Task(err) => match err {
                TaskError::InvalidSpec { .. } => "invalid_spec",
                TaskError::NotFound { .. } => "not_found",
                TaskError::NotReady { .. } => "not_ready",
                TaskError::InvalidTransition { .. } => "invalid_transition",
                TaskError::TaskFailed { .. } => "task_failed",
                TaskError::LeaseLost { .. } => "lease_lost",
                TaskError::ConcurrentModification { .. } => "busy",
                TaskError::StoreUnavailable(_) => "store_unavailable",
                TaskError::QueueUnavailable(_) => "queue_unavailable",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::BadRequest(message) => json!({ "error": self.code(), "message": message }),
            // Still running: answer like a status poll.
            Self::Task(TaskError::NotReady { task_id, state }) => {
                json!({ "task_id": task_id, "state": state })
            },
            Self::Task(TaskError::TaskFailed { task_id, failure }) => json!({
                "error": self.code(),
                "task_id": task_id,
                "info": FailureInfo {
                    failing_module: failure.failing_module.clone(),
                    error_detail: failure.error_detail.clone(),
                    reason: failure.reason,
                },
            }),
            Self::Task(err) => {
                if status.is_server_error() {
                    tracing::error!(error = %err, "request failed");
                }
                json!({ "error": self.code(), "message": err.to_string() })
            },
        };
        (status, Json(body)).into_response()
    }
}
