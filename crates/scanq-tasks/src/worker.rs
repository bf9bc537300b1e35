//! Worker pool.
//!
//! [`WorkerPool::start`] spawns `workers` independent loops and one reaper.
//! Each worker repeatedly dequeues a [`Delivery`] and drives it through:
//!
//! 1. **claim** - write `STARTED` with this delivery's attempt number;
//! 2. **lease** - a sidecar task renews the queue lease every third of the
//!    visibility timeout. If the lease is refused, or renewals keep failing
//!    until it is about to lapse, the running module is dropped and the
//!    delivery is left to its next attempt;
//! 3. **modules** - run in declared order under one wall-clock deadline; a
//!    `PROGRESS` write follows every module except the last;
//! 4. **terminal write** - `SUCCESS` with all results, or `FAILURE` naming
//!    the first module that failed;
//! 5. **ack** - only after the terminal write landed.
//!
//! Store writes at module boundaries are retried with backoff. If they still
//! fail, the delivery is abandoned without an ack and the visibility timeout
//! hands it to another worker.
//!
//! The reaper requeues deliveries whose lease expired, fails tasks that ran
//! out of attempts with reason `worker_lost`, and evicts expired records.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::check::ModuleRegistry;
use crate::constants::{DEFAULT_REAP_INTERVAL, DEFAULT_TASK_TIME_LIMIT};
use crate::context::ProgressReporter;
use crate::domain::{weighted_percent, FailureReason, TaskFailure, TaskRecord};
use crate::error::TaskError;
use crate::metrics::PoolMetrics;
use crate::queue::{Delivery, JobQueue, Receipt};
use crate::store::{ProgressUpdate, TaskStore};
use crate::types::task::TaskId;

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops. `0` starts nothing, not even the
    /// reaper.
    pub workers: usize,
    /// Wall-clock limit for one attempt of one task.
    pub task_time_limit: Duration,
    /// Period of the reaper.
    pub reap_interval: Duration,
    /// Extra attempts for a failed boundary or terminal write.
    pub write_retries: u32,
    /// Delay before the first write retry. Doubles on each retry.
    pub write_backoff: Duration,
    /// Prefix of worker ids recorded on claimed tasks.
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            task_time_limit: DEFAULT_TASK_TIME_LIMIT,
            reap_interval: DEFAULT_REAP_INTERVAL,
            write_retries: 3,
            write_backoff: Duration::from_millis(100),
            name: "worker".to_string(),
        }
    }
}

/// Per-task cancellation signals shared between the service and workers.
///
/// Entries are keyed by task and tagged with the attempt that registered
/// them, so a superseded attempt cannot remove its successor's entry.
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<DashMap<TaskId, (u32, CancellationToken)>>,
}

impl CancelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers attempt `attempt` of `task_id` and returns its token.
    pub fn register(&self, task_id: &TaskId, attempt: u32) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .insert(task_id.clone(), (attempt, token.clone()));
        token
    }

    /// Signals the running attempt of `task_id`, if this process runs it.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        match self.tokens.get(task_id) {
            Some(entry) => {
                entry.value().1.cancel();
                true
            },
            None => false,
        }
    }

    /// Drops the entry for `task_id` if it still belongs to `attempt`.
    pub fn remove(&self, task_id: &TaskId, attempt: u32) {
        self.tokens
            .remove_if(task_id, |_, (registered, _)| *registered == attempt);
    }

    /// Number of registered attempts.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// How one attempt ended.
enum Outcome {
    Succeeded(Map<String, Value>),
    Failed(TaskFailure),
    /// The record is already terminal (cancelled elsewhere) or gone.
    Terminated,
    /// A newer attempt owns the task, or this attempt's lease lapsed.
    Superseded,
    /// Leave the delivery for redelivery.
    Abandoned(String),
}

/// The renewal sidecar of one running attempt.
struct Lease {
    stop: CancellationToken,
    lost: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<ModuleRegistry>,
    cancellations: CancelRegistry,
    metrics: Arc<PoolMetrics>,
    config: WorkerConfig,
}

/// A configured, not yet running pool. Build one with
/// [`JobService::worker_pool`](crate::JobService::worker_pool).
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct PoolHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    /// Token that stops the pool when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops dequeuing and waits for every loop to exit. Running tasks stop
    /// at their next module boundary without an ack, so they are redelivered.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "worker loop panicked");
                }
            }
        }
        tracing::info!("worker pool stopped");
    }
}

impl WorkerPool {
    /// Assembles a pool from shared engine parts.
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn JobQueue>,
        registry: Arc<ModuleRegistry>,
        cancellations: CancelRegistry,
        metrics: Arc<PoolMetrics>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                queue,
                registry,
                cancellations,
                metrics,
                config,
            }),
        }
    }

    /// The pool's configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    /// Spawns the worker loops and the reaper.
    pub fn start(&self) -> PoolHandle {
        let shutdown = CancellationToken::new();
        let count = self.shared.config.workers;
        if count == 0 {
            tracing::info!("worker pool configured with no workers, nothing started");
            return PoolHandle {
                shutdown,
                tasks: Vec::new(),
            };
        }
        let mut tasks = Vec::with_capacity(count + 1);

        for n in 0..count {
            let shared = Arc::clone(&self.shared);
            let worker_id = format!("{}-{n}", shared.config.name);
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                shared.worker_loop(worker_id, shutdown).await;
            }));
        }

        let shared = Arc::clone(&self.shared);
        let reaper_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            shared.reaper_loop(reaper_shutdown).await;
        }));

        tracing::info!(workers = count, "worker pool started");
        PoolHandle { shutdown, tasks }
    }

    /// Runs one reaper pass immediately.
    pub async fn reap_once(&self) {
        self.shared.reap_once().await;
    }
}

impl Shared {
    async fn worker_loop(&self, worker_id: String, shutdown: CancellationToken) {
        tracing::debug!(worker = %worker_id, "worker started");
        loop {
            let delivery = match self.queue.dequeue(&shutdown).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(worker = %worker_id, error = %e, "dequeue failed");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.write_backoff) => continue,
                    }
                },
            };

            let span = tracing::info_span!(
                "task",
                task_id = %delivery.envelope.task_id,
                attempt = delivery.attempt,
                worker = %worker_id,
            );
            // Taken no earlier than the queue stamped the lease.
            let leased_at = Instant::now();
            self.process(&worker_id, delivery, leased_at, &shutdown)
                .instrument(span)
                .await;
        }
        tracing::debug!(worker = %worker_id, "worker stopped");
    }

    async fn process(
        &self,
        worker_id: &str,
        delivery: Delivery,
        leased_at: Instant,
        shutdown: &CancellationToken,
    ) {
        let task_id = &delivery.envelope.task_id;
        let attempt = delivery.attempt;

        // Registered before the claim so a cancel racing the claim is seen.
        let cancel = self.cancellations.register(task_id, attempt);

        match self.store.claim(task_id, worker_id, attempt).await {
            Ok(_) => {},
            Err(TaskError::InvalidTransition { from, .. }) => {
                tracing::info!(state = %from, "task already finished, dropping delivery");
                self.cancellations.remove(task_id, attempt);
                self.ack(&delivery.receipt).await;
                return;
            },
            Err(TaskError::NotFound { .. }) => {
                tracing::warn!("no record for delivered task, dropping delivery");
                self.cancellations.remove(task_id, attempt);
                self.ack(&delivery.receipt).await;
                return;
            },
            Err(e) => {
                tracing::warn!(error = %e, "claim failed, leaving delivery for redelivery");
                self.cancellations.remove(task_id, attempt);
                return;
            },
        }

        self.metrics.task_claimed();
        let started = Instant::now();
        tracing::info!(modules = delivery.envelope.modules.len(), "task claimed");

        let lease = self.spawn_lease_renewal(delivery.receipt.clone(), leased_at);
        let outcome = self
            .run_modules(&delivery, &cancel, &lease.lost, shutdown)
            .await;
        let outcome = self.write_terminal(&delivery, outcome).await;
        lease.stop.cancel();
        let _ = lease.task.await;
        self.cancellations.remove(task_id, attempt);

        let elapsed = started.elapsed();
        match outcome {
            Outcome::Succeeded(_) => {
                self.metrics.task_finished(true, elapsed);
                tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "task succeeded");
                self.ack(&delivery.receipt).await;
            },
            Outcome::Failed(failure) => {
                self.metrics.task_finished(false, elapsed);
                tracing::warn!(
                    reason = ?failure.reason,
                    module = failure.failing_module.as_deref().unwrap_or("-"),
                    detail = %failure.error_detail,
                    "task failed"
                );
                self.ack(&delivery.receipt).await;
            },
            Outcome::Terminated => {
                self.metrics.attempt_ended(elapsed);
                tracing::info!("task was finished elsewhere, stopping");
                self.ack(&delivery.receipt).await;
            },
            Outcome::Superseded => {
                self.metrics.attempt_ended(elapsed);
                tracing::warn!("attempt lost its lease, leaving the delivery to the next one");
            },
            Outcome::Abandoned(reason) => {
                self.metrics.attempt_ended(elapsed);
                tracing::warn!(reason = %reason, "abandoning delivery for redelivery");
            },
        }
    }

    async fn run_modules(
        &self,
        delivery: &Delivery,
        cancel: &CancellationToken,
        lease_lost: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Outcome {
        let envelope = &delivery.envelope;
        let task_id = &envelope.task_id;
        let attempt = delivery.attempt;
        let weights = envelope.weights();
        let total = envelope.modules.len();
        let deadline = deadline_after(self.config.task_time_limit);
        let mut results = Map::new();

        for (index, spec) in envelope.modules.iter().enumerate() {
            if cancel.is_cancelled() {
                return Outcome::Terminated;
            }
            if lease_lost.is_cancelled() {
                return Outcome::Superseded;
            }
            if shutdown.is_cancelled() {
                return Outcome::Abandoned("worker shutting down".to_string());
            }

            let Some(module) = self.registry.get(&spec.module) else {
                return Outcome::Failed(TaskFailure::module(
                    &spec.module,
                    format!("module `{}` is not registered on this worker", spec.module),
                ));
            };

            let step = index + 1;
            let mut reporter = ProgressReporter::new(
                Arc::clone(&self.store),
                task_id.clone(),
                attempt,
                spec.module.clone(),
                step,
                total,
                cancel.clone(),
            );

            tracing::debug!(module = %spec.module, step, total, "running module");
            let run = AssertUnwindSafe(module.execute(&spec.params, &mut reporter)).catch_unwind();
            let finished = tokio::select! {
                biased;
                () = lease_lost.cancelled() => return Outcome::Superseded,
                finished = tokio::time::timeout_at(deadline, run) => finished,
            };
            let value = match finished {
                Err(_) => {
                    return Outcome::Failed(TaskFailure {
                        reason: FailureReason::TimeLimitExceeded,
                        failing_module: Some(spec.module.clone()),
                        error_detail: format!(
                            "task exceeded its time limit of {}s",
                            self.config.task_time_limit.as_secs()
                        ),
                    });
                },
                Ok(Err(panic)) => {
                    return Outcome::Failed(TaskFailure::module(
                        &spec.module,
                        format!("module panicked: {}", panic_message(panic.as_ref())),
                    ));
                },
                Ok(Ok(Err(_))) if cancel.is_cancelled() => return Outcome::Terminated,
                Ok(Ok(Err(e))) => {
                    return Outcome::Failed(TaskFailure::module(&spec.module, e.to_string()));
                },
                Ok(Ok(Ok(value))) => value,
            };
            results.insert(spec.module.clone(), value);

            if step < total {
                let update = ProgressUpdate {
                    current_step: step,
                    progress_percent: weighted_percent(&weights, step),
                    status_text: format!("Completed {} ({step}/{total})", spec.module),
                };
                let store = &self.store;
                let written = self
                    .write_with_retry(move || {
                        store.record_progress(task_id, attempt, update.clone())
                    })
                    .await;
                if let Err(e) = written {
                    return interrupted(e);
                }
            }
        }

        Outcome::Succeeded(results)
    }

    /// Persists a success or failure. Other outcomes pass through.
    async fn write_terminal(&self, delivery: &Delivery, outcome: Outcome) -> Outcome {
        let task_id = &delivery.envelope.task_id;
        let attempt = delivery.attempt;
        let store = &self.store;

        let written = match &outcome {
            Outcome::Succeeded(results) => Some(
                self.write_with_retry(move || store.complete(task_id, attempt, results.clone()))
                    .await,
            ),
            Outcome::Failed(failure) => Some(
                self.write_with_retry(move || store.fail(task_id, attempt, failure.clone()))
                    .await,
            ),
            _ => None,
        };

        match written {
            Some(Err(e)) => interrupted(e),
            _ => outcome,
        }
    }

    async fn write_with_retry<F, Fut>(&self, mut op: F) -> Result<TaskRecord, TaskError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<TaskRecord, TaskError>>,
    {
        let mut delay = self.config.write_backoff;
        let mut retries = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && retries < self.config.write_retries => {
                    retries += 1;
                    tracing::warn!(error = %e, retry = retries, "task write failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                },
                other => return other,
            }
        }
    }

    /// Renews the lease until stopped. `lost` fires when the queue refuses a
    /// renewal, or when no renewal has succeeded and the lease is within
    /// half a renewal interval of lapsing.
    fn spawn_lease_renewal(&self, receipt: Receipt, leased_at: Instant) -> Lease {
        let queue = Arc::clone(&self.queue);
        let visibility = queue.config().visibility_timeout;
        let interval = (visibility / 3).max(Duration::from_millis(10));
        let usable = visibility.saturating_sub(interval / 2);
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let (stopped, lose) = (stop.clone(), lost.clone());

        let task = tokio::spawn(
            async move {
                let mut give_up_at = instant_after(leased_at, usable);
                loop {
                    tokio::select! {
                        () = stopped.cancelled() => break,
                        () = tokio::time::sleep_until(give_up_at) => {
                            tracing::warn!("lease about to lapse without a renewal");
                            lose.cancel();
                            break;
                        },
                        () = tokio::time::sleep(interval) => {},
                    }
                    let requested = Instant::now();
                    match queue.extend(&receipt).await {
                        Ok(true) => {
                            give_up_at = instant_after(requested, usable);
                            tracing::trace!("lease renewed");
                        },
                        Ok(false) => {
                            tracing::warn!("lease expired before renewal");
                            lose.cancel();
                            break;
                        },
                        Err(e) => tracing::warn!(error = %e, "lease renewal failed"),
                    }
                }
            }
            .in_current_span(),
        );
        Lease { stop, lost, task }
    }

    async fn ack(&self, receipt: &Receipt) {
        match self.queue.ack(receipt).await {
            Ok(true) => {},
            Ok(false) => tracing::debug!("delivery was already reclaimed, ack ignored"),
            Err(e) => tracing::warn!(error = %e, "failed to ack delivery"),
        }
    }

    async fn reaper_loop(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.reap_interval) => {},
            }
            self.reap_once().await;
        }
    }

    async fn reap_once(&self) {
        match self.queue.reclaim_expired().await {
            Ok(outcome) => {
                if outcome.requeued > 0 {
                    self.metrics.deliveries_requeued(outcome.requeued);
                    tracing::info!(count = outcome.requeued, "requeued deliveries with expired leases");
                }
                for delivery in outcome.exhausted {
                    self.fail_lost(&delivery).await;
                }
            },
            Err(e) => tracing::warn!(error = %e, "reclaiming expired deliveries failed"),
        }

        match self.store.cleanup_expired().await {
            Ok(0) => {},
            Ok(removed) => tracing::debug!(removed, "evicted expired task records"),
            Err(e) => tracing::warn!(error = %e, "evicting expired task records failed"),
        }
    }

    async fn fail_lost(&self, delivery: &Delivery) {
        let task_id = &delivery.envelope.task_id;
        let attempt = delivery.attempt;
        let failure = TaskFailure::new(
            FailureReason::WorkerLost,
            format!("worker lost: no acknowledgement after {attempt} attempt(s)"),
        );
        let store = &self.store;
        match self
            .write_with_retry(move || store.fail(task_id, attempt, failure.clone()))
            .await
        {
            Ok(_) => {
                self.metrics.task_worker_lost();
                tracing::warn!(task_id = %task_id, attempt, "task failed after exhausting retries");
            },
            Err(TaskError::InvalidTransition { .. } | TaskError::NotFound { .. }) => {
                tracing::debug!(task_id = %task_id, "exhausted delivery was already finished");
            },
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "could not mark lost task as failed");
            },
        }
    }
}

fn interrupted(err: TaskError) -> Outcome {
    match err {
        TaskError::InvalidTransition { .. } | TaskError::NotFound { .. } => Outcome::Terminated,
        TaskError::LeaseLost { .. } => Outcome::Superseded,
        other => Outcome::Abandoned(other.to_string()),
    }
}

fn deadline_after(limit: Duration) -> Instant {
    instant_after(Instant::now(), limit)
}

fn instant_after(from: Instant, delay: Duration) -> Instant {
    // Roughly thirty years out when the delay is effectively unbounded.
    from.checked_add(delay)
        .unwrap_or_else(|| from + Duration::from_secs(86_400 * 365 * 30))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
