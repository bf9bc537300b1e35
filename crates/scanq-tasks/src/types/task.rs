//! Task identity and the lifecycle state machine.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// Opaque, globally unique task identifier (a `UUIDv4` string).
///
/// # Examples
///
/// ```
/// use scanq_tasks::TaskId;
///
/// let a = TaskId::generate();
/// let b = TaskId::generate();
/// assert_ne!(a, b);
/// assert_eq!(a.as_str().len(), 36);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrows the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a task.
///
/// # State Machine
///
/// ```text
/// PENDING  -> STARTED, FAILURE
/// STARTED  -> STARTED, PROGRESS, SUCCESS, FAILURE
/// PROGRESS -> STARTED, PROGRESS, SUCCESS, FAILURE
/// SUCCESS  -> (terminal)
/// FAILURE  -> (terminal)
/// ```
///
/// `STARTED -> STARTED` and `PROGRESS -> STARTED` happen when a redelivered
/// task is claimed again by another worker. `PROGRESS -> PROGRESS` is every
/// module boundary after the first.
///
/// # Examples
///
/// ```
/// use scanq_tasks::TaskState;
///
/// assert!(TaskState::Pending.can_transition_to(&TaskState::Started));
/// assert!(!TaskState::Pending.can_transition_to(&TaskState::Success));
/// assert!(!TaskState::Success.can_transition_to(&TaskState::Failure));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Accepted and queued; no worker has claimed it yet.
    Pending,
    /// Claimed by a worker; no module has finished yet.
    Started,
    /// At least one module has finished.
    Progress,
    /// Every module succeeded (terminal).
    Success,
    /// A module failed, the task was cancelled, or its worker was lost (terminal).
    Failure,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Started => write!(f, "STARTED"),
            Self::Progress => write!(f, "PROGRESS"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
        }
    }
}

impl TaskState {
    /// Returns `true` for `SUCCESS` and `FAILURE`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Returns `true` if moving from this state to `next` is allowed.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Started | Self::Failure),
            Self::Started | Self::Progress => matches!(
                next,
                Self::Started | Self::Progress | Self::Success | Self::Failure
            ),
            Self::Success | Self::Failure => false,
        }
    }

    /// Validates a transition, returning [`TaskError::InvalidTransition`] on
    /// rejection.
    pub fn validate_transition(&self, task_id: &TaskId, next: &Self) -> Result<(), TaskError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(TaskError::InvalidTransition {
                task_id: task_id.to_string(),
                from: *self,
                to: *next,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskState; 5] = [
        TaskState::Pending,
        TaskState::Started,
        TaskState::Progress,
        TaskState::Success,
        TaskState::Failure,
    ];

    #[test]
    fn serializes_upper_case() {
        assert_eq!(
            serde_json::to_string(&TaskState::Progress).unwrap(),
            "\"PROGRESS\""
        );
        let parsed: TaskState = serde_json::from_str("\"PENDING\"").unwrap();
        assert_eq!(parsed, TaskState::Pending);
    }

    #[test]
    fn display_matches_serde() {
        for state in ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json.trim_matches('"'), state.to_string());
        }
    }

    #[test]
    fn terminal_states_reject_everything() {
        for from in [TaskState::Success, TaskState::Failure] {
            for to in ALL {
                assert!(!from.can_transition_to(&to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn pending_cannot_skip_to_progress_or_success() {
        assert!(!TaskState::Pending.can_transition_to(&TaskState::Progress));
        assert!(!TaskState::Pending.can_transition_to(&TaskState::Success));
        assert!(!TaskState::Pending.can_transition_to(&TaskState::Pending));
    }

    #[test]
    fn running_states_can_be_reclaimed() {
        assert!(TaskState::Started.can_transition_to(&TaskState::Started));
        assert!(TaskState::Progress.can_transition_to(&TaskState::Started));
        assert!(TaskState::Progress.can_transition_to(&TaskState::Progress));
    }

    #[test]
    fn validate_transition_reports_context() {
        let id = TaskId::from("abc");
        let err = TaskState::Failure
            .validate_transition(&id, &TaskState::Started)
            .unwrap_err();
        match err {
            TaskError::InvalidTransition { task_id, from, to } => {
                assert_eq!(task_id, "abc");
                assert_eq!(from, TaskState::Failure);
                assert_eq!(to, TaskState::Started);
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn task_id_is_transparent_in_json() {
        let id = TaskId::from("0b0c");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"0b0c\"");
    }
}
