//! Defaults shared by the store, queue and worker pool.

use std::time::Duration;

/// Status text written on a freshly submitted task.
pub const PENDING_STATUS_TEXT: &str = "Task is waiting to be processed...";

/// Status text written when a worker claims a task.
pub const STARTED_STATUS_TEXT: &str = "Task started";

/// Error detail recorded when a task is cancelled on request.
pub const CANCELLED_DETAIL: &str = "Scan cancelled by user";

/// Value of the `status` field returned from a successful submission.
pub const SUBMITTED_STATUS: &str = "started";

/// How long a delivery stays invisible before it is considered lost.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Deliveries per task before the reaper gives up and fails it.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Hard wall-clock limit for one task attempt.
pub const DEFAULT_TASK_TIME_LIMIT: Duration = Duration::from_secs(3600);

/// How long terminal records stay readable. One day.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(86_400);

/// How often the reaper looks for expired leases and records.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Compare-and-swap attempts before a mutation gives up.
pub const MAX_CAS_RETRIES: usize = 8;
