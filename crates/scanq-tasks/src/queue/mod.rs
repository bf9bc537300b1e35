//! At-least-once job hand-off between submitters and workers.
//!
//! A [`Delivery`] returned by [`JobQueue::dequeue`] stays invisible to other
//! workers for [`QueueConfig::visibility_timeout`]. The worker renews the
//! lease with [`JobQueue::extend`] while it runs and removes the delivery
//! with [`JobQueue::ack`] after writing a terminal state. Deliveries whose
//! lease runs out are found by [`JobQueue::reclaim_expired`]: they go back
//! on the queue with `attempt + 1`, or are reported as exhausted once
//! `max_attempts` deliveries have been used up.
//!
//! Ordering across tasks is FIFO only in the absence of redeliveries.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::constants::{DEFAULT_MAX_ATTEMPTS, DEFAULT_VISIBILITY_TIMEOUT};
use crate::error::TaskError;
use crate::types::module::TaskEnvelope;

/// Queue behaviour settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// How long a delivery stays invisible without a lease renewal.
    pub visibility_timeout: Duration,
    /// Total deliveries allowed per task, first one included.
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Opaque handle identifying one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(pub String);

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One hand-off of an envelope to a worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The job.
    pub envelope: TaskEnvelope,
    /// Handle for `ack` and `extend`.
    pub receipt: Receipt,
    /// 1 for the first delivery, incremented on each redelivery.
    pub attempt: u32,
}

/// Result of a [`JobQueue::reclaim_expired`] sweep.
#[derive(Debug, Default)]
pub struct ReclaimOutcome {
    /// Deliveries put back on the queue for another attempt.
    pub requeued: usize,
    /// Deliveries whose retry budget is spent. The caller fails their tasks.
    pub exhausted: Vec<Delivery>,
}

/// Ready and in-flight counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    /// Waiting for a worker.
    pub ready: usize,
    /// Dequeued and not yet acknowledged.
    pub in_flight: usize,
}

/// Errors from queue backends.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue could not be reached.
    #[error("queue backend error: {0}")]
    Backend(String),

    /// A stored envelope could not be encoded or decoded.
    #[error("queue codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<QueueError> for TaskError {
    fn from(err: QueueError) -> Self {
        TaskError::QueueUnavailable(err.to_string())
    }
}

/// The hand-off channel between [`JobService`](crate::JobService) and the
/// worker pool.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Appends an envelope for its first delivery.
    async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<(), QueueError>;

    /// Waits for the next delivery. Returns `Ok(None)` once `shutdown` fires.
    async fn dequeue(&self, shutdown: &CancellationToken) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledges a delivery. Returns `false` if the receipt is unknown or
    /// its lease already expired.
    async fn ack(&self, receipt: &Receipt) -> Result<bool, QueueError>;

    /// Renews a delivery's lease. Returns `false` if the lease is gone.
    async fn extend(&self, receipt: &Receipt) -> Result<bool, QueueError>;

    /// Requeues or exhausts every delivery whose lease has expired.
    async fn reclaim_expired(&self) -> Result<ReclaimOutcome, QueueError>;

    /// Current ready and in-flight counts.
    async fn depth(&self) -> Result<QueueDepth, QueueError>;

    /// The queue's configuration.
    fn config(&self) -> &QueueConfig;
}
