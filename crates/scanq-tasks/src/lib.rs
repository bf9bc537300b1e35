//! Asynchronous job execution and progress tracking for scan modules.
//!
//! A submitted job is a list of [`ModuleSpec`]s. The job is recorded as
//! `PENDING` in a [`TaskStore`], handed to a [`JobQueue`], and picked up by a
//! [`WorkerPool`] that runs each [`CheckModule`] in order, publishing weighted
//! progress after every module and exactly one terminal state at the end.
//! Pollers read the record through [`StatusQuery`] without ever blocking on
//! worker activity.
//!
//! # Module Organization
//!
//! - [`types`] - Identifiers, the task state machine, envelopes and wire types
//! - [`domain`] - The stored [`TaskRecord`] and progress arithmetic
//! - [`store`] - Versioned state store (in-memory and Redis backends)
//! - [`queue`] - At-least-once delivery with visibility timeout and retries
//! - [`check`] - The [`CheckModule`] trait, registry and demonstration modules
//! - [`worker`] - The worker pool, lease renewal and the reaper
//! - [`service`] - [`JobService`], the submission and control entry point
//! - [`query`] - [`StatusQuery`], the read-only poll façade
//! - [`metrics`] - Execution counters
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use scanq_tasks::check::{demo, ModuleRegistry};
//! use scanq_tasks::queue::memory::InMemoryQueue;
//! use scanq_tasks::store::memory::InMemoryTaskStore;
//! use scanq_tasks::{JobService, ModuleSpec, TaskState};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), scanq_tasks::TaskError> {
//! let mut registry = ModuleRegistry::new();
//! registry.register(demo::EchoModule);
//!
//! let service = JobService::new(
//!     Arc::new(InMemoryTaskStore::default()),
//!     Arc::new(InMemoryQueue::default()),
//!     Arc::new(registry),
//! );
//! let task_id = service.submit(vec![ModuleSpec::new("echo")]).await?;
//! let record = service.get_status(&task_id).await?;
//! assert_eq!(record.state, TaskState::Pending);
//! # Ok(())
//! # }
//! ```

pub mod check;
pub mod constants;
pub mod context;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod query;
pub mod queue;
pub mod service;
pub mod store;
pub mod types;
pub mod worker;

pub use check::{CheckModule, ModuleRegistry};
pub use context::ProgressReporter;
pub use domain::{FailureReason, TaskFailure, TaskRecord};
pub use error::{ModuleError, TaskError};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use query::StatusQuery;
pub use queue::{Delivery, JobQueue, QueueConfig};
pub use service::{JobService, ServiceStats};
pub use store::{StoreConfig, TaskStore};
pub use types::*;
pub use worker::{CancelRegistry, PoolHandle, WorkerConfig, WorkerPool};
