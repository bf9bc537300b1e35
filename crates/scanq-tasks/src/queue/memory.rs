//! Single-process queue.
//!
//! Ready items sit in a `VecDeque`; dequeued items move to an in-flight map
//! keyed by receipt, stamped with a lease deadline. Waiting workers park on
//! a [`Notify`] and wake on enqueue or requeue.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    Delivery, JobQueue, QueueConfig, QueueDepth, QueueError, Receipt, ReclaimOutcome,
};
use crate::types::module::TaskEnvelope;

#[derive(Debug)]
struct Ready {
    envelope: TaskEnvelope,
    attempt: u32,
}

#[derive(Debug)]
struct InFlight {
    envelope: TaskEnvelope,
    attempt: u32,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Ready>,
    in_flight: HashMap<Receipt, InFlight>,
}

/// In-memory [`JobQueue`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use scanq_tasks::queue::memory::InMemoryQueue;
/// use scanq_tasks::queue::QueueConfig;
///
/// let queue = InMemoryQueue::new(QueueConfig {
///     visibility_timeout: Duration::from_secs(10),
///     max_attempts: 5,
/// });
/// ```
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    config: QueueConfig,
}

impl InMemoryQueue {
    /// Creates an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            config,
        }
    }

    fn try_pop(&self) -> Option<Delivery> {
        let mut state = self.state.lock();
        let item = state.ready.pop_front()?;
        let receipt = Receipt(Uuid::new_v4().to_string());
        state.in_flight.insert(
            receipt.clone(),
            InFlight {
                envelope: item.envelope.clone(),
                attempt: item.attempt,
                deadline: Instant::now() + self.config.visibility_timeout,
            },
        );
        Some(Delivery {
            envelope: item.envelope,
            receipt,
            attempt: item.attempt,
        })
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<(), QueueError> {
        self.state.lock().ready.push_back(Ready {
            envelope: envelope.clone(),
            attempt: 1,
        });
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, shutdown: &CancellationToken) -> Result<Option<Delivery>, QueueError> {
        loop {
            // Registered before the check so a concurrent enqueue is not missed.
            let notified = self.notify.notified();
            if shutdown.is_cancelled() {
                return Ok(None);
            }
            if let Some(delivery) = self.try_pop() {
                return Ok(Some(delivery));
            }
            tokio::select! {
                () = shutdown.cancelled() => return Ok(None),
                () = notified => {},
            }
        }
    }

    async fn ack(&self, receipt: &Receipt) -> Result<bool, QueueError> {
        Ok(self.state.lock().in_flight.remove(receipt).is_some())
    }

    async fn extend(&self, receipt: &Receipt) -> Result<bool, QueueError> {
        let mut state = self.state.lock();
        match state.in_flight.get_mut(receipt) {
            Some(item) => {
                item.deadline = Instant::now() + self.config.visibility_timeout;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn reclaim_expired(&self) -> Result<ReclaimOutcome, QueueError> {
        let now = Instant::now();
        let mut outcome = ReclaimOutcome::default();
        {
            let mut state = self.state.lock();
            let expired: Vec<Receipt> = state
                .in_flight
                .iter()
                .filter(|(_, item)| item.deadline <= now)
                .map(|(receipt, _)| receipt.clone())
                .collect();

            for receipt in expired {
                let Some(item) = state.in_flight.remove(&receipt) else {
                    continue;
                };
                if item.attempt < self.config.max_attempts {
                    state.ready.push_back(Ready {
                        envelope: item.envelope,
                        attempt: item.attempt + 1,
                    });
                    outcome.requeued += 1;
                } else {
                    outcome.exhausted.push(Delivery {
                        envelope: item.envelope,
                        receipt,
                        attempt: item.attempt,
                    });
                }
            }
        }
        for _ in 0..outcome.requeued {
            self.notify.notify_one();
        }
        Ok(outcome)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let state = self.state.lock();
        Ok(QueueDepth {
            ready: state.ready.len(),
            in_flight: state.in_flight.len(),
        })
    }

    fn config(&self) -> &QueueConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::types::module::ModuleSpec;

    fn envelope() -> TaskEnvelope {
        TaskEnvelope::new(vec![ModuleSpec::new("echo")])
    }

    fn queue(timeout_ms: u64, max_attempts: u32) -> InMemoryQueue {
        InMemoryQueue::new(QueueConfig {
            visibility_timeout: Duration::from_millis(timeout_ms),
            max_attempts,
        })
    }

    #[tokio::test]
    async fn dequeue_returns_first_attempt_in_order() {
        let q = queue(1_000, 3);
        let (a, b) = (envelope(), envelope());
        q.enqueue(&a).await.unwrap();
        q.enqueue(&b).await.unwrap();

        let token = CancellationToken::new();
        let first = q.dequeue(&token).await.unwrap().unwrap();
        let second = q.dequeue(&token).await.unwrap().unwrap();
        assert_eq!(first.envelope.task_id, a.task_id);
        assert_eq!(second.envelope.task_id, b.task_id);
        assert_eq!(first.attempt, 1);
        assert_ne!(first.receipt, second.receipt);
        assert_eq!(
            q.depth().await.unwrap(),
            QueueDepth {
                ready: 0,
                in_flight: 2
            }
        );
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue() {
        let q = Arc::new(queue(1_000, 3));
        let token = CancellationToken::new();
        let waiter = {
            let q = Arc::clone(&q);
            let token = token.clone();
            tokio::spawn(async move { q.dequeue(&token).await })
        };
        tokio::task::yield_now().await;
        let env = envelope();
        q.enqueue(&env).await.unwrap();

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.envelope.task_id, env.task_id);
    }

    #[tokio::test]
    async fn dequeue_returns_none_on_shutdown() {
        let q = queue(1_000, 3);
        let token = CancellationToken::new();
        token.cancel();
        assert!(q.dequeue(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_removes_delivery_once() {
        let q = queue(1_000, 3);
        q.enqueue(&envelope()).await.unwrap();
        let d = q.dequeue(&CancellationToken::new()).await.unwrap().unwrap();
        assert!(q.ack(&d.receipt).await.unwrap());
        assert!(!q.ack(&d.receipt).await.unwrap());
        assert_eq!(q.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_redelivered_with_next_attempt() {
        let q = queue(100, 3);
        let env = envelope();
        q.enqueue(&env).await.unwrap();
        let token = CancellationToken::new();
        let first = q.dequeue(&token).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        let outcome = q.reclaim_expired().await.unwrap();
        assert_eq!(outcome.requeued, 1);
        assert!(outcome.exhausted.is_empty());

        let second = q.dequeue(&token).await.unwrap().unwrap();
        assert_eq!(second.envelope.task_id, env.task_id);
        assert_eq!(second.attempt, 2);
        assert!(!q.ack(&first.receipt).await.unwrap(), "stale receipt");
        assert!(q.ack(&second.receipt).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn extend_keeps_delivery_in_flight() {
        let q = queue(100, 3);
        q.enqueue(&envelope()).await.unwrap();
        let d = q.dequeue(&CancellationToken::new()).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(q.extend(&d.receipt).await.unwrap());
        tokio::time::advance(Duration::from_millis(80)).await;

        let outcome = q.reclaim_expired().await.unwrap();
        assert_eq!(outcome.requeued, 0);
        assert!(q.ack(&d.receipt).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_exhaustion_is_reported() {
        let q = queue(10, 2);
        let env = envelope();
        q.enqueue(&env).await.unwrap();
        let token = CancellationToken::new();

        q.dequeue(&token).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(q.reclaim_expired().await.unwrap().requeued, 1);

        q.dequeue(&token).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        let outcome = q.reclaim_expired().await.unwrap();
        assert_eq!(outcome.requeued, 0);
        assert_eq!(outcome.exhausted.len(), 1);
        assert_eq!(outcome.exhausted[0].attempt, 2);
        assert_eq!(outcome.exhausted[0].envelope.task_id, env.task_id);
        assert_eq!(q.depth().await.unwrap(), QueueDepth::default());
    }
}
