//! Task storage: the [`TaskStore`] trait and its backends.
//!
//! [`TaskStore`] is the object-safe interface the service, workers and
//! pollers share (as `Arc<dyn TaskStore>`). The only implementation is
//! [`GenericTaskStore`](generic::GenericTaskStore), which holds all domain
//! rules and delegates bytes to a [`StorageBackend`](backend::StorageBackend):
//!
//! - [`memory::InMemoryBackend`] - `DashMap`, single process
//! - `redis::RedisBackend` - shared across processes (feature `redis`)
//!
//! # Write discipline
//!
//! Every mutation is a read, validate, compare-and-swap loop. Writes made on
//! behalf of a delivery carry its attempt number; a write whose attempt is
//! older than the one recorded on the task fails with
//! [`TaskError::LeaseLost`]. Terminal states accept no further writes.

pub mod backend;
pub mod generic;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::constants::{DEFAULT_RETENTION, MAX_CAS_RETRIES};
use crate::domain::{TaskFailure, TaskRecord};
use crate::error::TaskError;
use crate::types::module::TaskEnvelope;
use crate::types::task::TaskId;

use self::backend::StorageBackend;
use self::generic::GenericTaskStore;

/// Store-wide settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long terminal records stay readable. `None` keeps them forever.
    pub retention: Option<Duration>,
    /// Compare-and-swap attempts per mutation before giving up with
    /// [`TaskError::ConcurrentModification`].
    pub max_cas_retries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention: Some(DEFAULT_RETENTION),
            max_cas_retries: MAX_CAS_RETRIES,
        }
    }
}

/// A module-boundary progress write.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Modules finished so far.
    pub current_step: usize,
    /// Weighted completion after those modules.
    pub progress_percent: f64,
    /// Status line to show.
    pub status_text: String,
}

/// Shared, concurrency-safe task state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Writes the `PENDING` record for a newly submitted envelope.
    async fn create(&self, envelope: &TaskEnvelope) -> Result<TaskRecord, TaskError>;

    /// Reads a record. Expired records read as [`TaskError::NotFound`].
    async fn get(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError>;

    /// Marks the task `STARTED` on behalf of delivery `attempt`.
    async fn claim(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        attempt: u32,
    ) -> Result<TaskRecord, TaskError>;

    /// Records a module boundary and moves the task to `PROGRESS`.
    async fn record_progress(
        &self,
        task_id: &TaskId,
        attempt: u32,
        update: ProgressUpdate,
    ) -> Result<TaskRecord, TaskError>;

    /// Replaces the status line without touching the percentage.
    async fn set_status_text(
        &self,
        task_id: &TaskId,
        attempt: u32,
        text: String,
    ) -> Result<TaskRecord, TaskError>;

    /// Moves the task to `SUCCESS` with the per-module results.
    async fn complete(
        &self,
        task_id: &TaskId,
        attempt: u32,
        result: Map<String, Value>,
    ) -> Result<TaskRecord, TaskError>;

    /// Moves the task to `FAILURE`.
    async fn fail(
        &self,
        task_id: &TaskId,
        attempt: u32,
        failure: TaskFailure,
    ) -> Result<TaskRecord, TaskError>;

    /// Moves a non-terminal task to `FAILURE` with reason `cancelled`.
    async fn cancel(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError>;

    /// Removes a record. Returns `true` if it existed.
    async fn delete(&self, task_id: &TaskId) -> Result<bool, TaskError>;

    /// Evicts terminal records past their retention window.
    async fn cleanup_expired(&self) -> Result<usize, TaskError>;

    /// The store's configuration.
    fn config(&self) -> &StoreConfig;
}

#[async_trait]
impl<B: StorageBackend + 'static> TaskStore for GenericTaskStore<B> {
    async fn create(&self, envelope: &TaskEnvelope) -> Result<TaskRecord, TaskError> {
        GenericTaskStore::create(self, envelope).await
    }

    async fn get(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        GenericTaskStore::get(self, task_id).await
    }

    async fn claim(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        attempt: u32,
    ) -> Result<TaskRecord, TaskError> {
        GenericTaskStore::claim(self, task_id, worker_id, attempt).await
    }

    async fn record_progress(
        &self,
        task_id: &TaskId,
        attempt: u32,
        update: ProgressUpdate,
    ) -> Result<TaskRecord, TaskError> {
        GenericTaskStore::record_progress(self, task_id, attempt, update).await
    }

    async fn set_status_text(
        &self,
        task_id: &TaskId,
        attempt: u32,
        text: String,
    ) -> Result<TaskRecord, TaskError> {
        GenericTaskStore::set_status_text(self, task_id, attempt, text).await
    }

    async fn complete(
        &self,
        task_id: &TaskId,
        attempt: u32,
        result: Map<String, Value>,
    ) -> Result<TaskRecord, TaskError> {
        GenericTaskStore::complete(self, task_id, attempt, result).await
    }

    async fn fail(
        &self,
        task_id: &TaskId,
        attempt: u32,
        failure: TaskFailure,
    ) -> Result<TaskRecord, TaskError> {
        GenericTaskStore::fail(self, task_id, attempt, failure).await
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        GenericTaskStore::cancel(self, task_id).await
    }

    async fn delete(&self, task_id: &TaskId) -> Result<bool, TaskError> {
        GenericTaskStore::delete(self, task_id).await
    }

    async fn cleanup_expired(&self) -> Result<usize, TaskError> {
        GenericTaskStore::cleanup_expired(self).await
    }

    fn config(&self) -> &StoreConfig {
        GenericTaskStore::config(self)
    }
}
