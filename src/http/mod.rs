//! HTTP boundary.
//!
//! | Method | Path | Success |
//! |--------|------|---------|
//! | `POST` | `/jobs` | `202` `{ task_id, status: "started" }` |
//! | `GET` | `/jobs/{task_id}` | `200` status poll |
//! | `GET` | `/jobs/{task_id}/result` | `200` results, `202` while running |
//! | `POST` | `/jobs/{task_id}/cancel` | `200` cancelled status |
//! | `GET` | `/jobs/stats` | `200` counters and queue depth |
//! | `GET` | `/health` | `200` |

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use scanq_tasks::JobService;

pub use error::ApiError;

/// Shared handler state.
#[derive(Debug)]
pub struct AppState {
    /// The engine entry point.
    pub service: JobService,
}

/// Builds the application router.
pub fn router(service: JobService) -> Router {
    let state = Arc::new(AppState { service });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/jobs", post(handlers::submit_job))
        .route("/jobs/stats", get(handlers::stats))
        .route("/jobs/{task_id}", get(handlers::job_status))
        .route("/jobs/{task_id}/result", get(handlers::job_result))
        .route("/jobs/{task_id}/cancel", post(handlers::cancel_job))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
