//! Read-only access for pollers.
//!
//! Every call is a single store read; none of them wait for workers or
//! touch the queue.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::domain::{FailureReason, TaskFailure, TaskRecord};
use crate::error::TaskError;
use crate::store::TaskStore;
use crate::types::task::{TaskId, TaskState};
use crate::types::wire::JobStatusResponse;

/// Status and result lookups over a [`TaskStore`].
#[derive(Clone)]
pub struct StatusQuery {
    store: Arc<dyn TaskStore>,
}

impl std::fmt::Debug for StatusQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusQuery").finish_non_exhaustive()
    }
}

impl StatusQuery {
    /// Wraps a store.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// The full stored record.
    pub async fn get_status(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        self.store.get(task_id).await
    }

    /// The record projected into its wire shape.
    pub async fn status_response(&self, task_id: &TaskId) -> Result<JobStatusResponse, TaskError> {
        let record = self.store.get(task_id).await?;
        Ok(JobStatusResponse::from(&record))
    }

    /// The per-module results of a successful task.
    ///
    /// Fails with [`TaskError::NotReady`] while the task runs and with
    /// [`TaskError::TaskFailed`] if it failed.
    pub async fn get_result(&self, task_id: &TaskId) -> Result<Map<String, Value>, TaskError> {
        let record = self.store.get(task_id).await?;
        match record.state {
            TaskState::Success => Ok(record.result.unwrap_or_default()),
            TaskState::Failure => Err(TaskError::TaskFailed {
                task_id: task_id.to_string(),
                failure: record.error.unwrap_or_else(|| {
                    TaskFailure::new(
                        FailureReason::ModuleError,
                        "task failed without a recorded error",
                    )
                }),
            }),
            state => Err(TaskError::NotReady {
                task_id: task_id.to_string(),
                state,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryTaskStore;
    use crate::types::module::{ModuleSpec, TaskEnvelope};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup() -> (Arc<InMemoryTaskStore>, StatusQuery, TaskId) {
        let store = Arc::new(InMemoryTaskStore::default());
        let env = TaskEnvelope::new(vec![ModuleSpec::new("echo")]);
        store.create(&env).await.unwrap();
        let query = StatusQuery::new(store.clone());
        (store, query, env.task_id)
    }

    #[tokio::test]
    async fn result_not_ready_while_running() {
        let (store, query, id) = setup().await;
        let err = query.get_result(&id).await.unwrap_err();
        assert!(matches!(err, TaskError::NotReady { state: TaskState::Pending, .. }));

        store.claim(&id, "w", 1).await.unwrap();
        let err = query.get_result(&id).await.unwrap_err();
        assert!(matches!(err, TaskError::NotReady { state: TaskState::Started, .. }));
    }

    #[tokio::test]
    async fn result_of_success_is_stable() {
        let (store, query, id) = setup().await;
        store.claim(&id, "w", 1).await.unwrap();
        let mut result = Map::new();
        result.insert("echo".into(), json!({ "ok": true }));
        store.complete(&id, 1, result.clone()).await.unwrap();

        assert_eq!(query.get_result(&id).await.unwrap(), result);
        assert_eq!(query.get_result(&id).await.unwrap(), result);
        let status = query.status_response(&id).await.unwrap();
        assert_eq!(status.state, TaskState::Success);
        assert_eq!(status.result, Some(result));
    }

    #[tokio::test]
    async fn result_of_failure_carries_the_failure() {
        let (store, query, id) = setup().await;
        store.claim(&id, "w", 1).await.unwrap();
        store
            .fail(&id, 1, TaskFailure::module("echo", "boom"))
            .await
            .unwrap();

        match query.get_result(&id).await.unwrap_err() {
            TaskError::TaskFailed { failure, .. } => {
                assert_eq!(failure.failing_module.as_deref(), Some("echo"));
                assert_eq!(failure.error_detail, "boom");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let (_store, query, _id) = setup().await;
        let err = query.get_status(&TaskId::from("nope")).await.unwrap_err();
        assert!(matches!(err, TaskError::NotFound { .. }));
    }
}
