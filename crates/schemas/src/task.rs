// Task types
//
// A Task is a unit of work leased from the orchestrator. The automator holds
// it for the duration of a single poll/execute/update cycle.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Task status as reported by the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    InProgress,
    Canceled,
    Failed,
    FailedWithTerminalError,
    Completed,
    CompletedWithErrors,
    #[default]
    Scheduled,
    TimedOut,
    Skipped,
}

impl TaskStatus {
    /// Whether the status is terminal on the server side
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::InProgress | TaskStatus::Scheduled)
    }

    /// Whether the status counts as a successful outcome
    pub fn is_successful(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::CompletedWithErrors | TaskStatus::Skipped
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::InProgress => write!(f, "IN_PROGRESS"),
            TaskStatus::Canceled => write!(f, "CANCELED"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::FailedWithTerminalError => write!(f, "FAILED_WITH_TERMINAL_ERROR"),
            TaskStatus::Completed => write!(f, "COMPLETED"),
            TaskStatus::CompletedWithErrors => write!(f, "COMPLETED_WITH_ERRORS"),
            TaskStatus::Scheduled => write!(f, "SCHEDULED"),
            TaskStatus::TimedOut => write!(f, "TIMED_OUT"),
            TaskStatus::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// A task leased from the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Server-issued task id; blank means "no task"
    #[serde(default)]
    pub task_id: String,
    /// Task type (task definition name) this task belongs to
    #[serde(default)]
    pub task_type: String,
    /// Workflow instance that owns this task
    #[serde(default)]
    pub workflow_instance_id: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub input_data: Map<String, Value>,
    #[serde(default)]
    pub output_data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_task_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub poll_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub callback_after_seconds: u64,
    #[serde(default)]
    pub response_timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_for_incompletion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_input_payload_storage_path: Option<String>,
}

impl Task {
    /// Create a scheduled task with the given id and type
    pub fn new(task_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            ..Default::default()
        }
    }

    /// Set the owning workflow instance id
    pub fn with_workflow_instance_id(mut self, id: impl Into<String>) -> Self {
        self.workflow_instance_id = id.into();
        self
    }

    /// Add an input value
    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input_data.insert(key.into(), value.into());
        self
    }

    /// Set the task domain
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// True when the id is missing or whitespace only
    pub fn has_blank_id(&self) -> bool {
        self.task_id.trim().is_empty()
    }
}
