//! Generic task store with all domain logic delegating to a [`StorageBackend`].
//!
//! [`GenericTaskStore`] implements every domain operation (state machine
//! transitions, attempt fencing, monotonic progress, terminal payloads,
//! retention stamping, CAS retries, JSON serialization) on top of any
//! [`StorageBackend`]. Backends stay dumb key-value stores.
//!
//! # CAS Semantics
//!
//! All mutations (except `create`) read the record, apply the change to a
//! copy and write it back with [`StorageBackend::put_if_version`]. On a
//! version conflict the whole read-apply-write cycle is retried, up to
//! [`StoreConfig::max_cas_retries`] times, after which the store returns
//! [`TaskError::ConcurrentModification`]. Validation runs on every retry, so a
//! write that loses a race against a terminal transition fails with
//! [`TaskError::InvalidTransition`] instead of overwriting it.

use serde_json::{Map, Value};

use crate::constants::{CANCELLED_DETAIL, STARTED_STATUS_TEXT};
use crate::domain::{FailureReason, TaskFailure, TaskRecord};
use crate::error::TaskError;
use crate::store::backend::{StorageBackend, StorageError};
use crate::store::{ProgressUpdate, StoreConfig};
use crate::types::module::TaskEnvelope;
use crate::types::task::{TaskId, TaskState};

/// Task store that delegates storage to a [`StorageBackend`].
///
/// # Examples
///
/// ```
/// use scanq_tasks::store::generic::GenericTaskStore;
/// use scanq_tasks::store::memory::InMemoryBackend;
/// use scanq_tasks::store::StoreConfig;
///
/// let store = GenericTaskStore::new(InMemoryBackend::new())
///     .with_config(StoreConfig { retention: None, ..StoreConfig::default() });
/// assert!(store.config().retention.is_none());
/// ```
#[derive(Debug)]
pub struct GenericTaskStore<B: StorageBackend> {
    backend: B,
    config: StoreConfig,
}

impl<B: StorageBackend> GenericTaskStore<B> {
    /// Creates a store over `backend` with [`StoreConfig::default`].
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: StoreConfig::default(),
        }
    }

    /// Sets the store configuration.
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    // ---- Serialization helpers (private) ----

    fn serialize_record(record: &TaskRecord) -> Result<Vec<u8>, TaskError> {
        serde_json::to_vec(record).map_err(|e| {
            TaskError::StoreUnavailable(format!("failed to serialize TaskRecord: {e}"))
        })
    }

    fn deserialize_record(data: &[u8]) -> Result<TaskRecord, TaskError> {
        serde_json::from_slice(data).map_err(|e| {
            TaskError::StoreUnavailable(format!("failed to deserialize TaskRecord: {e}"))
        })
    }

    fn map_storage_error(err: StorageError, task_id: &TaskId) -> TaskError {
        match err {
            StorageError::NotFound { .. } => TaskError::NotFound {
                task_id: task_id.to_string(),
            },
            StorageError::VersionConflict { .. } => TaskError::ConcurrentModification {
                task_id: task_id.to_string(),
            },
            StorageError::Backend { message, .. } => TaskError::StoreUnavailable(message),
        }
    }

    fn expiry_epoch(record: &TaskRecord) -> Option<i64> {
        record.expires_at.map(|at| at.timestamp())
    }

    /// Rejects writes from a delivery older than the one that last claimed
    /// the task.
    fn check_attempt(record: &TaskRecord, attempt: u32) -> Result<(), TaskError> {
        if attempt < record.attempt {
            return Err(TaskError::LeaseLost {
                task_id: record.task_id.to_string(),
                attempt,
                current_attempt: record.attempt,
            });
        }
        Ok(())
    }

    /// Read-apply-CAS loop shared by every mutation.
    async fn mutate<F>(&self, task_id: &TaskId, mut apply: F) -> Result<TaskRecord, TaskError>
    where
        F: FnMut(&mut TaskRecord) -> Result<(), TaskError> + Send,
    {
        let key = task_id.as_str();
        for _ in 0..self.config.max_cas_retries.max(1) {
            let versioned = self
                .backend
                .get(key)
                .await
                .map_err(|e| Self::map_storage_error(e, task_id))?;

            let mut record = Self::deserialize_record(&versioned.data)?;
            if record.is_expired() {
                return Err(TaskError::NotFound {
                    task_id: task_id.to_string(),
                });
            }

            apply(&mut record)?;
            record.touch(self.config.retention);

            let bytes = Self::serialize_record(&record)?;
            match self
                .backend
                .put_if_version(key, &bytes, versioned.version, Self::expiry_epoch(&record))
                .await
            {
                Ok(version) => {
                    record.version = version;
                    return Ok(record);
                },
                Err(StorageError::VersionConflict {
                    expected, actual, ..
                }) => {
                    tracing::debug!(
                        task_id = %task_id,
                        expected,
                        actual,
                        "version conflict on task write, retrying"
                    );
                },
                Err(e) => return Err(Self::map_storage_error(e, task_id)),
            }
        }

        tracing::warn!(task_id = %task_id, "giving up on contended task write");
        Err(TaskError::ConcurrentModification {
            task_id: task_id.to_string(),
        })
    }

    // ---- Domain operations (public) ----

    /// Writes the `PENDING` record for `envelope`.
    pub async fn create(&self, envelope: &TaskEnvelope) -> Result<TaskRecord, TaskError> {
        let mut record = TaskRecord::pending(envelope);
        let bytes = Self::serialize_record(&record)?;
        let version = self
            .backend
            .put(record.task_id.as_str(), &bytes, None)
            .await
            .map_err(|e| Self::map_storage_error(e, &record.task_id))?;
        record.version = version;
        Ok(record)
    }

    /// Reads a record. Expired records are reported as not found.
    pub async fn get(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        let versioned = self
            .backend
            .get(task_id.as_str())
            .await
            .map_err(|e| Self::map_storage_error(e, task_id))?;

        let mut record = Self::deserialize_record(&versioned.data)?;
        if record.is_expired() {
            return Err(TaskError::NotFound {
                task_id: task_id.to_string(),
            });
        }
        record.version = versioned.version;
        Ok(record)
    }

    /// Claims the task for `worker_id` under delivery `attempt`.
    ///
    /// Progress and step counters are kept, so a re-claimed task never shows
    /// a lower percentage than before.
    pub async fn claim(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        attempt: u32,
    ) -> Result<TaskRecord, TaskError> {
        self.mutate(task_id, |record| {
            record
                .state
                .validate_transition(task_id, &TaskState::Started)?;
            Self::check_attempt(record, attempt)?;
            record.state = TaskState::Started;
            record.attempt = attempt;
            record.worker_id = Some(worker_id.to_string());
            record.status_text = Some(STARTED_STATUS_TEXT.to_string());
            Ok(())
        })
        .await
    }

    /// Records a module boundary. The stored percentage only ever grows.
    pub async fn record_progress(
        &self,
        task_id: &TaskId,
        attempt: u32,
        update: ProgressUpdate,
    ) -> Result<TaskRecord, TaskError> {
        self.mutate(task_id, |record| {
            record
                .state
                .validate_transition(task_id, &TaskState::Progress)?;
            Self::check_attempt(record, attempt)?;
            record.state = TaskState::Progress;
            record.current_step = record.current_step.max(update.current_step);
            record.progress_percent = record
                .progress_percent
                .max(update.progress_percent.clamp(0.0, 100.0));
            record.status_text = Some(update.status_text.clone());
            Ok(())
        })
        .await
    }

    /// Replaces the status line. A `STARTED` task moves to `PROGRESS` so the
    /// text becomes visible to pollers; the percentage is untouched.
    pub async fn set_status_text(
        &self,
        task_id: &TaskId,
        attempt: u32,
        text: String,
    ) -> Result<TaskRecord, TaskError> {
        self.mutate(task_id, |record| {
            record
                .state
                .validate_transition(task_id, &TaskState::Progress)?;
            Self::check_attempt(record, attempt)?;
            record.state = TaskState::Progress;
            record.status_text = Some(text.clone());
            Ok(())
        })
        .await
    }

    /// Moves the task to `SUCCESS`, pinning progress to 100.
    pub async fn complete(
        &self,
        task_id: &TaskId,
        attempt: u32,
        result: Map<String, Value>,
    ) -> Result<TaskRecord, TaskError> {
        self.mutate(task_id, |record| {
            record
                .state
                .validate_transition(task_id, &TaskState::Success)?;
            Self::check_attempt(record, attempt)?;
            record.state = TaskState::Success;
            record.current_step = record.total_steps;
            record.progress_percent = 100.0;
            record.status_text = Some("Task completed".to_string());
            record.result = Some(result.clone());
            record.error = None;
            Ok(())
        })
        .await
    }

    /// Moves the task to `FAILURE`. Progress stays where it was.
    pub async fn fail(
        &self,
        task_id: &TaskId,
        attempt: u32,
        failure: TaskFailure,
    ) -> Result<TaskRecord, TaskError> {
        self.mutate(task_id, |record| {
            record
                .state
                .validate_transition(task_id, &TaskState::Failure)?;
            Self::check_attempt(record, attempt)?;
            record.state = TaskState::Failure;
            record.status_text = Some(failure.error_detail.clone());
            record.error = Some(failure.clone());
            record.result = None;
            Ok(())
        })
        .await
    }

    /// Cancels a non-terminal task.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        self.mutate(task_id, |record| {
            record
                .state
                .validate_transition(task_id, &TaskState::Failure)?;
            // Only a running task has a module in flight.
            let in_flight = if record.state == TaskState::Pending {
                None
            } else {
                record.modules.get(record.current_step).cloned()
            };
            record.state = TaskState::Failure;
            record.status_text = Some(CANCELLED_DETAIL.to_string());
            record.error = Some(TaskFailure {
                reason: FailureReason::Cancelled,
                failing_module: in_flight,
                error_detail: CANCELLED_DETAIL.to_string(),
            });
            record.result = None;
            Ok(())
        })
        .await
    }

    /// Deletes a record.
    pub async fn delete(&self, task_id: &TaskId) -> Result<bool, TaskError> {
        self.backend
            .delete(task_id.as_str())
            .await
            .map_err(|e| Self::map_storage_error(e, task_id))
    }

    /// Evicts expired records.
    pub async fn cleanup_expired(&self) -> Result<usize, TaskError> {
        self.backend
            .cleanup_expired()
            .await
            .map_err(|e| TaskError::StoreUnavailable(e.to_string()))
    }
}
