//! Request and response bodies for the job endpoints.
//!
//! These are the only shapes pollers see. [`JobStatusResponse`] is derived
//! from a [`TaskRecord`] and hides storage-only fields such as the attempt
//! counter, the claiming worker and the CAS version.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::SUBMITTED_STATUS;
use crate::domain::{FailureReason, TaskRecord};

use super::module::ModuleSpec;
use super::task::{TaskId, TaskState};

/// Body of `POST /jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    /// Modules to run, in order.
    pub modules: Vec<ModuleSpec>,
}

/// Response to a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    /// Id to poll.
    pub task_id: TaskId,
    /// Always `"started"`.
    pub status: String,
}

impl SubmitJobResponse {
    /// Builds the acknowledgement for `task_id`.
    pub fn accepted(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: SUBMITTED_STATUS.to_string(),
        }
    }
}

/// Progress details exposed while a task is in `PROGRESS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    /// Modules finished so far.
    pub current_step: usize,
    /// Modules in the task.
    pub total_steps: usize,
    /// Latest human-readable status line.
    pub status_text: String,
    /// Weighted completion, 0 to 100.
    pub progress_percent: f64,
}

/// Failure details exposed once a task is in `FAILURE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// The module that failed, if the failure came from a module.
    pub failing_module: Option<String>,
    /// Error message.
    pub error_detail: String,
    /// Why the task failed.
    pub reason: FailureReason,
}

/// The `info` payload of a status response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobInfo {
    /// Present in `PROGRESS`.
    Progress(ProgressInfo),
    /// Present in `FAILURE`.
    Failure(FailureInfo),
}

/// Body of `GET /jobs/{task_id}`.
///
/// | state | fields |
/// |-------|--------|
/// | `PENDING`, `STARTED` | `task_id`, `state` |
/// | `PROGRESS` | plus `info` with step, text and percent |
/// | `SUCCESS` | plus `result` keyed by module id |
/// | `FAILURE` | plus `info` with the failing module and detail |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusResponse {
    /// The polled id.
    pub task_id: TaskId,
    /// Current state.
    pub state: TaskState,
    /// Progress or failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<JobInfo>,
    /// Per-module results once successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
}

impl From<&TaskRecord> for JobStatusResponse {
    fn from(record: &TaskRecord) -> Self {
        let (info, result) = match record.state {
            TaskState::Pending | TaskState::Started => (None, None),
            TaskState::Progress => (
                Some(JobInfo::Progress(ProgressInfo {
                    current_step: record.current_step,
                    total_steps: record.total_steps,
                    status_text: record.status_text.clone().unwrap_or_default(),
                    progress_percent: record.progress_percent,
                })),
                None,
            ),
            TaskState::Success => (None, record.result.clone()),
            TaskState::Failure => (
                record.error.as_ref().map(|failure| {
                    JobInfo::Failure(FailureInfo {
                        failing_module: failure.failing_module.clone(),
                        error_detail: failure.error_detail.clone(),
                        reason: failure.reason,
                    })
                }),
                None,
            ),
        };

        Self {
            task_id: record.task_id.clone(),
            state: record.state,
            info,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskFailure;
    use crate::types::module::TaskEnvelope;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record() -> TaskRecord {
        let envelope = TaskEnvelope::new(vec![ModuleSpec::new("a"), ModuleSpec::new("b")]);
        TaskRecord::pending(&envelope)
    }

    #[test]
    fn pending_has_no_info_or_result() {
        let r = record();
        let value = serde_json::to_value(JobStatusResponse::from(&r)).unwrap();
        assert_eq!(
            value,
            json!({ "task_id": r.task_id.as_str(), "state": "PENDING" })
        );
    }

    #[test]
    fn progress_exposes_step_and_percent() {
        let mut r = record();
        r.state = TaskState::Progress;
        r.current_step = 1;
        r.progress_percent = 50.0;
        r.status_text = Some("Completed a".to_string());
        let value = serde_json::to_value(JobStatusResponse::from(&r)).unwrap();
        assert_eq!(
            value["info"],
            json!({
                "current_step": 1,
                "total_steps": 2,
                "status_text": "Completed a",
                "progress_percent": 50.0
            })
        );
        assert!(value.get("result").is_none());
    }

    #[test]
    fn failure_exposes_failing_module() {
        let mut r = record();
        r.state = TaskState::Failure;
        r.error = Some(TaskFailure::module("b", "timeout talking to target"));
        let value = serde_json::to_value(JobStatusResponse::from(&r)).unwrap();
        assert_eq!(
            value["info"],
            json!({
                "failing_module": "b",
                "error_detail": "timeout talking to target",
                "reason": "module_error"
            })
        );
    }

    #[test]
    fn success_exposes_result_map() {
        let mut r = record();
        r.state = TaskState::Success;
        let mut result = Map::new();
        result.insert("a".into(), json!({ "ok": true }));
        r.result = Some(result);
        let resp = JobStatusResponse::from(&r);
        assert!(resp.info.is_none());
        assert_eq!(resp.result.unwrap()["a"], json!({ "ok": true }));
    }

    #[test]
    fn failure_info_round_trips_through_untagged_enum() {
        let json = json!({
            "task_id": "t",
            "state": "FAILURE",
            "info": { "failing_module": null, "error_detail": "lost", "reason": "worker_lost" }
        });
        let resp: JobStatusResponse = serde_json::from_value(json).unwrap();
        assert!(matches!(resp.info, Some(JobInfo::Failure(_))));
    }
}
