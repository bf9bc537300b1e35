//! Execution counters for the submission path and the worker pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Lock-free counters shared by the service, workers and reaper.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    submitted: AtomicU64,
    claimed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    requeued: AtomicU64,
    worker_lost: AtomicU64,
    running: AtomicU64,
    run_time_ms: AtomicU64,
}

/// Point-in-time copy of [`PoolMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Tasks accepted by `submit`.
    pub submitted: u64,
    /// Deliveries claimed by a worker (redeliveries included).
    pub claimed: u64,
    /// Tasks that reached `SUCCESS`.
    pub succeeded: u64,
    /// Tasks failed by a module error or the time limit.
    pub failed: u64,
    /// Tasks cancelled on request.
    pub cancelled: u64,
    /// Deliveries requeued after a lease expired.
    pub requeued: u64,
    /// Tasks failed because their retry budget ran out.
    pub worker_lost: u64,
    /// Deliveries currently executing.
    pub running: u64,
    /// Mean wall-clock time of finished attempts, in milliseconds.
    pub average_run_ms: u64,
}

impl PoolMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn task_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_claimed(&self) {
        self.claimed.fetch_add(1, Ordering::Relaxed);
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_finished(&self, success: bool, elapsed: Duration) {
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.attempt_ended(elapsed);
    }

    /// An attempt ended without a terminal write of its own (abandoned,
    /// superseded or cancelled).
    pub(crate) fn attempt_ended(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.run_time_ms.fetch_add(ms, Ordering::Relaxed);
        // Saturating decrement.
        let _ = self
            .running
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn task_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn deliveries_requeued(&self, count: usize) {
        self.requeued.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn task_worker_lost(&self) {
        self.worker_lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let claimed = self.claimed.load(Ordering::Relaxed);
        let running = self.running.load(Ordering::Relaxed);
        let ended = claimed.saturating_sub(running);
        let run_time_ms = self.run_time_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            claimed,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            worker_lost: self.worker_lost.load(Ordering::Relaxed),
            running,
            average_run_ms: run_time_ms.checked_div(ended).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn snapshot_tracks_lifecycle() {
        let m = PoolMetrics::new();
        m.task_submitted();
        m.task_submitted();
        m.task_claimed();
        m.task_claimed();
        m.task_finished(true, Duration::from_millis(100));
        m.task_finished(false, Duration::from_millis(300));
        m.task_cancelled();
        m.deliveries_requeued(2);
        m.task_worker_lost();

        assert_eq!(
            m.snapshot(),
            MetricsSnapshot {
                submitted: 2,
                claimed: 2,
                succeeded: 1,
                failed: 1,
                cancelled: 1,
                requeued: 2,
                worker_lost: 1,
                running: 0,
                average_run_ms: 200,
            }
        );
    }

    #[test]
    fn running_never_underflows() {
        let m = PoolMetrics::new();
        m.attempt_ended(Duration::ZERO);
        assert_eq!(m.snapshot().running, 0);
    }
}
