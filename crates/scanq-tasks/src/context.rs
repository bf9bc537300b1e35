//! Per-module execution context.
//!
//! A [`ProgressReporter`] is handed to each [`CheckModule`](crate::CheckModule)
//! invocation. It is scoped to one task, one delivery attempt and one module,
//! so a module cannot write to any other task. Sub-step text is advisory: a
//! failed write is logged and the module keeps running. The mandatory
//! progress writes happen in the worker, between modules.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::store::TaskStore;
use crate::types::task::TaskId;

/// Handle a running module uses to publish status and observe cancellation.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn TaskStore>,
    task_id: TaskId,
    attempt: u32,
    module: String,
    step: usize,
    total_steps: usize,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .field("module", &self.module)
            .field("step", &self.step)
            .field("total_steps", &self.total_steps)
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    /// Creates a reporter for module number `step` (1-based) of a task.
    pub fn new(
        store: Arc<dyn TaskStore>,
        task_id: TaskId,
        attempt: u32,
        module: impl Into<String>,
        step: usize,
        total_steps: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            task_id,
            attempt,
            module: module.into(),
            step,
            total_steps,
            cancel,
        }
    }

    /// The task being executed.
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// The module this reporter belongs to.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// 1-based position of this module in the task.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Number of modules in the task.
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Publishes a sub-step status line, e.g. `"scanning header 3 of 7"`.
    ///
    /// Does not advance the percentage. Returns `false` if the write did not
    /// land; the module may ignore this.
    pub async fn status(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        match self
            .store
            .set_status_text(&self.task_id, self.attempt, text)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    task_id = %self.task_id,
                    module = %self.module,
                    error = %e,
                    "sub-step status update dropped"
                );
                false
            },
        }
    }

    /// Returns `true` once cancellation was requested for this task.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested. Useful in `tokio::select!`.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}
