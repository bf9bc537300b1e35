//! Task record -- the store's representation of one task's lifecycle.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::PENDING_STATUS_TEXT;
use crate::types::module::TaskEnvelope;
use crate::types::task::{TaskId, TaskState};

/// Why a task ended in `FAILURE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// A check module returned an error or panicked.
    ModuleError,
    /// Deliveries kept timing out until the retry budget ran out.
    WorkerLost,
    /// Cancelled on request.
    Cancelled,
    /// The task ran past its wall-clock limit.
    TimeLimitExceeded,
}

/// Error payload of a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Failure category.
    pub reason: FailureReason,
    /// The module that was running, when there was one.
    pub failing_module: Option<String>,
    /// Human-readable detail.
    pub error_detail: String,
}

impl TaskFailure {
    /// A module error attributed to `module`.
    pub fn module(module: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            reason: FailureReason::ModuleError,
            failing_module: Some(module.into()),
            error_detail: detail.into(),
        }
    }

    /// A failure with no specific module.
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            failing_module: None,
            error_detail: detail.into(),
        }
    }
}

/// Stored state of a task.
///
/// `result` is only ever set in `SUCCESS` and `error` only in `FAILURE`; the
/// store enforces this by writing them in the same update as the terminal
/// transition. `progress_percent` never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Lookup key.
    pub task_id: TaskId,
    /// Lifecycle state.
    pub state: TaskState,
    /// Module identifiers in execution order.
    pub modules: Vec<String>,
    /// Modules finished so far.
    pub current_step: usize,
    /// Number of modules.
    pub total_steps: usize,
    /// Latest human-readable status line.
    pub status_text: Option<String>,
    /// Weighted completion, 0 to 100.
    pub progress_percent: f64,
    /// Per-module results, set on `SUCCESS`.
    pub result: Option<Map<String, Value>>,
    /// Failure details, set on `FAILURE`.
    pub error: Option<TaskFailure>,
    /// Delivery attempt that last claimed the task. Writes from older
    /// attempts are rejected.
    pub attempt: u32,
    /// Worker that last claimed the task.
    pub worker_id: Option<String>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Time of the last successful write.
    pub updated_at: DateTime<Utc>,
    /// When a terminal record becomes eligible for eviction.
    pub expires_at: Option<DateTime<Utc>>,
    /// Backend CAS version. Not serialized; filled in on read.
    #[serde(skip)]
    pub version: u64,
}

impl TaskRecord {
    /// Builds the initial `PENDING` record for a submitted envelope.
    pub fn pending(envelope: &TaskEnvelope) -> Self {
        Self {
            task_id: envelope.task_id.clone(),
            state: TaskState::Pending,
            modules: envelope.module_names(),
            current_step: 0,
            total_steps: envelope.modules.len(),
            status_text: Some(PENDING_STATUS_TEXT.to_string()),
            progress_percent: 0.0,
            result: None,
            error: None,
            attempt: 0,
            worker_id: None,
            created_at: envelope.submitted_at,
            updated_at: envelope.submitted_at,
            expires_at: None,
            version: 0,
        }
    }

    /// Returns `true` once `expires_at` has passed.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }

    /// Returns `true` in `SUCCESS` or `FAILURE`.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Stamps `updated_at` and, for terminal records, the retention deadline.
    pub(crate) fn touch(&mut self, retention: Option<Duration>) {
        let now = Utc::now();
        self.updated_at = now;
        if self.state.is_terminal() {
            // Overflowing retention windows mean "keep forever".
            self.expires_at = retention
                .and_then(|r| chrono::Duration::from_std(r).ok())
                .and_then(|r| now.checked_add_signed(r));
        }
    }
}
