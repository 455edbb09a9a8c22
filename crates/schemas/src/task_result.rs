// Task result types
//
// A TaskResult carries the outcome of one execution attempt back to the
// orchestrator. A fresh result is built per attempt and never shared
// between tasks.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::task::{Task, TaskStatus};

/// Status a worker may report for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResultStatus {
    InProgress,
    Failed,
    FailedWithTerminalError,
    Completed,
}

impl std::fmt::Display for TaskResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskResultStatus::InProgress => write!(f, "IN_PROGRESS"),
            TaskResultStatus::Failed => write!(f, "FAILED"),
            TaskResultStatus::FailedWithTerminalError => write!(f, "FAILED_WITH_TERMINAL_ERROR"),
            TaskResultStatus::Completed => write!(f, "COMPLETED"),
        }
    }
}

impl From<TaskStatus> for TaskResultStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::InProgress | TaskStatus::Scheduled => TaskResultStatus::InProgress,
            TaskStatus::Completed => TaskResultStatus::Completed,
            TaskStatus::FailedWithTerminalError => TaskResultStatus::FailedWithTerminalError,
            TaskStatus::Failed
            | TaskStatus::Canceled
            | TaskStatus::CompletedWithErrors
            | TaskStatus::TimedOut
            | TaskStatus::Skipped => TaskResultStatus::Failed,
        }
    }
}

/// A single execution log line attached to a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecLog {
    pub log: String,
    pub task_id: String,
    /// Creation time in epoch milliseconds
    pub created_time: i64,
}

/// Outcome of executing a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub workflow_instance_id: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_for_incompletion: Option<String>,
    #[serde(default)]
    pub callback_after_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub status: TaskResultStatus,
    #[serde(default)]
    pub output_data: Map<String, Value>,
    #[serde(default)]
    pub logs: Vec<TaskExecLog>,
    /// Set when the output was moved to external storage before upload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_output_payload_storage_path: Option<String>,
}

impl TaskResult {
    /// Build a result for the given task, seeded from its current state
    pub fn new(task: &Task) -> Self {
        Self {
            workflow_instance_id: task.workflow_instance_id.clone(),
            task_id: task.task_id.clone(),
            reason_for_incompletion: task.reason_for_incompletion.clone(),
            callback_after_seconds: task.callback_after_seconds,
            worker_id: task.worker_id.clone(),
            status: task.status.into(),
            output_data: task.output_data.clone(),
            logs: Vec::new(),
            external_output_payload_storage_path: None,
        }
    }

    /// Result marked COMPLETED
    pub fn completed(task: &Task) -> Self {
        Self::new(task).with_status(TaskResultStatus::Completed)
    }

    /// Result marked IN_PROGRESS, asking the server to call back later
    pub fn in_progress(task: &Task, callback_after_seconds: u64) -> Self {
        let mut result = Self::new(task).with_status(TaskResultStatus::InProgress);
        result.callback_after_seconds = callback_after_seconds;
        result
    }

    /// Result marked FAILED with a reason
    pub fn failed(task: &Task, reason: impl Into<String>) -> Self {
        let mut result = Self::new(task).with_status(TaskResultStatus::Failed);
        result.reason_for_incompletion = Some(reason.into());
        result
    }

    pub fn with_status(mut self, status: TaskResultStatus) -> Self {
        self.status = status;
        self
    }

    /// Add an output value
    pub fn add_output(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.output_data.insert(key.into(), value.into());
        self
    }

    /// Append an execution log line stamped with the current time
    pub fn log(&mut self, line: impl Into<String>) -> &mut Self {
        self.logs.push(TaskExecLog {
            log: line.into(),
            task_id: self.task_id.clone(),
            created_time: Utc::now().timestamp_millis(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_copies_identity_from_task() {
        let mut task = Task::new("t-1", "encode").with_workflow_instance_id("wf-9");
        task.status = TaskStatus::InProgress;
        task.callback_after_seconds = 30;

        let result = TaskResult::new(&task);

        assert_eq!(result.task_id, "t-1");
        assert_eq!(result.workflow_instance_id, "wf-9");
        assert_eq!(result.status, TaskResultStatus::InProgress);
        assert_eq!(result.callback_after_seconds, 30);
        assert!(result.logs.is_empty());
    }

    #[test]
    fn test_status_mapping_from_task() {
        assert_eq!(
            TaskResultStatus::from(TaskStatus::Scheduled),
            TaskResultStatus::InProgress
        );
        assert_eq!(
            TaskResultStatus::from(TaskStatus::TimedOut),
            TaskResultStatus::Failed
        );
        assert_eq!(
            TaskResultStatus::from(TaskStatus::Completed),
            TaskResultStatus::Completed
        );
    }

    #[test]
    fn test_failed_result_and_logs() {
        let task = Task::new("t-2", "resize");
        let mut result = TaskResult::failed(&task, "disk full");
        result.log("retrying later").add_output("attempt", 2);

        assert_eq!(result.status, TaskResultStatus::Failed);
        assert_eq!(result.reason_for_incompletion.as_deref(), Some("disk full"));
        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.logs[0].task_id, "t-2");
        assert_eq!(result.output_data["attempt"], json!(2));
    }

    #[test]
    fn test_serializes_camel_case() {
        let task = Task::new("t-3", "notify");
        let value = serde_json::to_value(TaskResult::completed(&task)).unwrap();

        assert_eq!(value["taskId"], "t-3");
        assert_eq!(value["status"], "COMPLETED");
        assert!(value.get("externalOutputPayloadStoragePath").is_none());
    }
}
