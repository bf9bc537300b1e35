//! Submission and control entry point.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::check::ModuleRegistry;
use crate::domain::TaskRecord;
use crate::error::TaskError;
use crate::metrics::{MetricsSnapshot, PoolMetrics};
use crate::query::StatusQuery;
use crate::queue::{JobQueue, QueueDepth};
use crate::store::TaskStore;
use crate::types::module::{ModuleSpec, TaskEnvelope};
use crate::types::task::TaskId;
use crate::types::wire::JobStatusResponse;
use crate::worker::{CancelRegistry, WorkerConfig, WorkerPool};

/// Engine counters plus queue depth, as served by `GET /jobs/stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    /// Execution counters.
    pub tasks: MetricsSnapshot,
    /// Queue depth at the time of the call.
    pub queue: QueueDepth,
}

/// Validates and enqueues jobs, answers polls and cancels tasks.
///
/// Cloning is cheap; all parts are shared.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<ModuleRegistry>,
    cancellations: CancelRegistry,
    metrics: Arc<PoolMetrics>,
    query: StatusQuery,
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl JobService {
    /// Wires a service to a store, a queue and the modules it may run.
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn JobQueue>,
        registry: Arc<ModuleRegistry>,
    ) -> Self {
        Self {
            query: StatusQuery::new(Arc::clone(&store)),
            store,
            queue,
            registry,
            cancellations: CancelRegistry::new(),
            metrics: Arc::new(PoolMetrics::new()),
        }
    }

    /// Validates `modules`, records a `PENDING` task and enqueues it.
    ///
    /// Returns as soon as the job is durably enqueued; no module runs on
    /// the caller's task.
    ///
    /// # Errors
    ///
    /// - [`TaskError::InvalidSpec`] for an empty list, an unknown or
    ///   duplicated module id, a non-positive weight, or parameters the
    ///   module rejects. Nothing is stored.
    /// - [`TaskError::StoreUnavailable`] / [`TaskError::QueueUnavailable`]
    ///   if either could not be written. No orphan record is left behind.
    pub async fn submit(&self, modules: Vec<ModuleSpec>) -> Result<TaskId, TaskError> {
        self.validate(&modules)?;

        let envelope = TaskEnvelope::new(modules);
        let task_id = envelope.task_id.clone();
        self.store.create(&envelope).await?;

        if let Err(e) = self.queue.enqueue(&envelope).await {
            tracing::error!(task_id = %task_id, error = %e, "enqueue failed, removing record");
            if let Err(cleanup) = self.store.delete(&task_id).await {
                tracing::warn!(task_id = %task_id, error = %cleanup, "could not remove orphan record");
            }
            return Err(e.into());
        }

        self.metrics.task_submitted();
        tracing::info!(
            task_id = %task_id,
            modules = ?envelope.module_names(),
            "job submitted"
        );
        Ok(task_id)
    }

    fn validate(&self, modules: &[ModuleSpec]) -> Result<(), TaskError> {
        if modules.is_empty() {
            return Err(TaskError::invalid_spec("a job needs at least one module"));
        }

        let mut seen = HashSet::with_capacity(modules.len());
        for spec in modules {
            if !seen.insert(spec.module.as_str()) {
                return Err(TaskError::invalid_spec(format!(
                    "module `{}` appears more than once",
                    spec.module
                )));
            }
            if !(spec.weight.is_finite() && spec.weight > 0.0) {
                return Err(TaskError::invalid_spec(format!(
                    "module `{}` has weight {}, expected a positive number",
                    spec.module, spec.weight
                )));
            }
            let module = self.registry.get(&spec.module).ok_or_else(|| {
                TaskError::invalid_spec(format!("unknown module `{}`", spec.module))
            })?;
            module.validate(&spec.params).map_err(|e| {
                TaskError::invalid_spec(format!("module `{}`: {e}", spec.module))
            })?;
        }
        Ok(())
    }

    /// Current record of a task.
    pub async fn get_status(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        self.query.get_status(task_id).await
    }

    /// Current state in wire shape.
    pub async fn status_response(&self, task_id: &TaskId) -> Result<JobStatusResponse, TaskError> {
        self.query.status_response(task_id).await
    }

    /// Results of a successful task. See [`StatusQuery::get_result`].
    pub async fn get_result(&self, task_id: &TaskId) -> Result<Map<String, Value>, TaskError> {
        self.query.get_result(task_id).await
    }

    /// Cancels a task that has not finished yet.
    ///
    /// The record moves to `FAILURE` with reason `cancelled` immediately. A
    /// worker running the task in this process is signalled and stops at
    /// its next check; workers elsewhere stop at their next store write.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        let record = self.store.cancel(task_id).await?;
        let signalled = self.cancellations.cancel(task_id);
        self.metrics.task_cancelled();
        tracing::info!(task_id = %task_id, signalled, "task cancelled");
        Ok(record)
    }

    /// Counters and queue depth.
    pub async fn stats(&self) -> Result<ServiceStats, TaskError> {
        Ok(ServiceStats {
            tasks: self.metrics.snapshot(),
            queue: self.queue.depth().await?,
        })
    }

    /// Builds a worker pool sharing this service's store, queue, modules,
    /// cancellation signals and counters.
    pub fn worker_pool(&self, config: WorkerConfig) -> WorkerPool {
        WorkerPool::new(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            self.cancellations.clone(),
            Arc::clone(&self.metrics),
            config,
        )
    }

    /// Read-only view for pollers.
    pub fn query(&self) -> &StatusQuery {
        &self.query
    }

    /// Shared counters.
    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    /// The modules this service accepts.
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::demo::{EchoModule, MultiplyModule};
    use crate::domain::FailureReason;
    use crate::queue::memory::InMemoryQueue;
    use crate::queue::{Delivery, QueueConfig, QueueError, Receipt, ReclaimOutcome};
    use crate::store::memory::InMemoryTaskStore;
    use crate::types::task::TaskState;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    fn registry() -> Arc<ModuleRegistry> {
        let mut registry = ModuleRegistry::new();
        registry
            .register(EchoModule)
            .register(MultiplyModule::default());
        Arc::new(registry)
    }

    fn service() -> (JobService, Arc<InMemoryTaskStore>, Arc<InMemoryQueue>) {
        let store = Arc::new(InMemoryTaskStore::default());
        let queue = Arc::new(InMemoryQueue::default());
        let service = JobService::new(store.clone(), queue.clone(), registry());
        (service, store, queue)
    }

    async fn expect_invalid(service: &JobService, modules: Vec<ModuleSpec>) {
        let err = service.submit(modules).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidSpec { .. }), "got {err}");
    }

    #[tokio::test]
    async fn submit_records_pending_and_enqueues() {
        let (service, _store, queue) = service();
        let id = service.submit(vec![ModuleSpec::new("echo")]).await.unwrap();

        let record = service.get_status(&id).await.unwrap();
        assert_eq!(record.state, TaskState::Pending);
        assert_eq!(record.progress_percent, 0.0);
        assert_eq!(queue.depth().await.unwrap().ready, 1);
        assert_eq!(service.metrics().snapshot().submitted, 1);
    }

    #[tokio::test]
    async fn submit_rejects_bad_specs_without_side_effects() {
        let (service, store, queue) = service();
        expect_invalid(&service, vec![]).await;
        expect_invalid(&service, vec![ModuleSpec::new("sqli")]).await;
        expect_invalid(
            &service,
            vec![ModuleSpec::new("echo"), ModuleSpec::new("echo")],
        )
        .await;
        expect_invalid(&service, vec![ModuleSpec::new("echo").with_weight(0.0)]).await;
        expect_invalid(
            &service,
            vec![ModuleSpec::new("echo").with_weight(f64::NAN)],
        )
        .await;
        expect_invalid(
            &service,
            vec![ModuleSpec::new("multiply").with_param("x", 2)],
        )
        .await;

        assert!(store.backend().is_empty());
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
        assert_eq!(service.metrics().snapshot().submitted, 0);
    }

    #[tokio::test]
    async fn submissions_get_distinct_ids() {
        let (service, _store, _queue) = service();
        let a = service.submit(vec![ModuleSpec::new("echo")]).await.unwrap();
        let b = service.submit(vec![ModuleSpec::new("echo")]).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn cancel_pending_task() {
        let (service, _store, _queue) = service();
        let id = service.submit(vec![ModuleSpec::new("echo")]).await.unwrap();

        let record = service.cancel(&id).await.unwrap();
        assert_eq!(record.state, TaskState::Failure);
        assert_eq!(
            record.error.map(|e| e.reason),
            Some(FailureReason::Cancelled)
        );

        let err = service.cancel(&id).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
        assert_eq!(service.metrics().snapshot().cancelled, 1);
    }

    #[tokio::test]
    async fn cancel_signals_local_worker() {
        let (service, store, _queue) = service();
        let id = service.submit(vec![ModuleSpec::new("echo")]).await.unwrap();
        store.claim(&id, "w", 1).await.unwrap();
        let token = service.cancellations.register(&id, 1);

        service.cancel(&id).await.unwrap();
        assert!(token.is_cancelled());
    }

    struct BrokenQueue(QueueConfig);

    #[async_trait]
    impl JobQueue for BrokenQueue {
        async fn enqueue(&self, _: &TaskEnvelope) -> Result<(), QueueError> {
            Err(QueueError::Backend("connection refused".into()))
        }
        async fn dequeue(&self, _: &CancellationToken) -> Result<Option<Delivery>, QueueError> {
            Ok(None)
        }
        async fn ack(&self, _: &Receipt) -> Result<bool, QueueError> {
            Ok(false)
        }
        async fn extend(&self, _: &Receipt) -> Result<bool, QueueError> {
            Ok(false)
        }
        async fn reclaim_expired(&self) -> Result<ReclaimOutcome, QueueError> {
            Ok(ReclaimOutcome::default())
        }
        async fn depth(&self) -> Result<QueueDepth, QueueError> {
            Err(QueueError::Backend("connection refused".into()))
        }
        fn config(&self) -> &QueueConfig {
            &self.0
        }
    }

    #[tokio::test]
    async fn enqueue_failure_leaves_no_record() {
        let store = Arc::new(InMemoryTaskStore::default());
        let service = JobService::new(
            store.clone(),
            Arc::new(BrokenQueue(QueueConfig::default())),
            registry(),
        );

        let err = service
            .submit(vec![ModuleSpec::new("echo")])
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::QueueUnavailable(_)));
        assert!(store.backend().is_empty());
        assert!(matches!(
            service.stats().await.unwrap_err(),
            TaskError::QueueUnavailable(_)
        ));
    }
}
