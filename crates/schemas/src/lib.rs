// Taskrunner Schemas
//
// Decision: This crate is the source of truth for the task payloads shared by
// the automator and its transport collaborators
// Decision: No runtime logic beyond constructors and small mutators

pub mod task;
pub mod task_result;

pub use task::{Task, TaskStatus};
pub use task_result::{TaskExecLog, TaskResult, TaskResultStatus};
