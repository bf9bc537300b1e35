//! Error types for job submission, execution and status queries.
//!
//! [`TaskError`] is returned by every store, queue-facing and service
//! operation. [`ModuleError`] is what a [`CheckModule`](crate::CheckModule)
//! returns; it never escapes a worker and is recorded on the task instead.

use thiserror::Error;

use crate::domain::TaskFailure;
use crate::types::task::TaskState;

/// Errors surfaced by the engine to its callers.
///
/// # Examples
///
/// ```
/// use scanq_tasks::TaskError;
///
/// let err = TaskError::NotFound {
///     task_id: "missing-task".to_string(),
/// };
/// assert!(err.to_string().contains("missing-task"));
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug, Error)]
pub enum TaskError {
    /// The submission was malformed; no task was created.
    #[error("invalid job spec: {reason}")]
    InvalidSpec {
        /// Why the submission was rejected.
        reason: String,
    },

    /// No record exists for the id, or it has been evicted.
    #[error("task not found: {task_id}")]
    NotFound {
        /// The id that was looked up.
        task_id: String,
    },

    /// The state machine rejected the requested transition.
    #[error("invalid transition from {from} to {to} for task {task_id}")]
    InvalidTransition {
        /// The task being transitioned.
        task_id: String,
        /// State of the stored record.
        from: TaskState,
        /// Requested target state.
        to: TaskState,
    },

    /// A write carried an attempt number older than the stored one. The
    /// delivery was superseded by a redelivery.
    #[error("lease lost for task {task_id}: attempt {attempt} superseded by {current_attempt}")]
    LeaseLost {
        /// The task being written.
        task_id: String,
        /// Attempt carried by the rejected write.
        attempt: u32,
        /// Attempt currently recorded on the task.
        current_attempt: u32,
    },

    /// Compare-and-swap kept failing under contention.
    #[error("concurrent modification of task {task_id}")]
    ConcurrentModification {
        /// The contended task.
        task_id: String,
    },

    /// A result was requested before the task reached a terminal state.
    #[error("task {task_id} is not finished (state: {state})")]
    NotReady {
        /// The task id.
        task_id: String,
        /// Its current non-terminal state.
        state: TaskState,
    },

    /// A result was requested from a task that failed.
    #[error("task {task_id} failed: {}", failure.error_detail)]
    TaskFailed {
        /// The task id.
        task_id: String,
        /// The recorded failure.
        failure: TaskFailure,
    },

    /// The state store could not be reached or returned garbage.
    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    /// The queue could not be reached.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
}

impl TaskError {
    /// Shorthand for [`TaskError::InvalidSpec`].
    pub fn invalid_spec(reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            reason: reason.into(),
        }
    }

    /// Returns `true` for infrastructure errors worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::ConcurrentModification { .. }
        )
    }
}

/// Error returned by a check module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    /// The module's parameters were missing or malformed.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The module ran and failed.
    #[error("{0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FailureReason;

    #[test]
    fn invalid_transition_display_names_both_states() {
        let err = TaskError::InvalidTransition {
            task_id: "t-1".to_string(),
            from: TaskState::Success,
            to: TaskState::Failure,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition from SUCCESS to FAILURE for task t-1"
        );
    }

    #[test]
    fn task_failed_display_uses_detail() {
        let err = TaskError::TaskFailed {
            task_id: "t-2".to_string(),
            failure: TaskFailure {
                reason: FailureReason::ModuleError,
                failing_module: Some("headers".to_string()),
                error_detail: "connection refused".to_string(),
            },
        };
        assert_eq!(err.to_string(), "task t-2 failed: connection refused");
    }

    #[test]
    fn only_infrastructure_errors_are_retryable() {
        assert!(TaskError::StoreUnavailable("down".into()).is_retryable());
        assert!(TaskError::ConcurrentModification {
            task_id: "t".into()
        }
        .is_retryable());
        assert!(!TaskError::QueueUnavailable("down".into()).is_retryable());
        assert!(!TaskError::invalid_spec("empty").is_retryable());
    }

    #[test]
    fn module_error_display() {
        assert_eq!(
            ModuleError::InvalidParams("x must be an integer".into()).to_string(),
            "invalid parameters: x must be an integer"
        );
        assert_eq!(ModuleError::Failed("boom".into()).to_string(), "boom");
    }
}
