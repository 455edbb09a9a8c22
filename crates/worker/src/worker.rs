//! Worker contract
//!
//! A [`Worker`] is the user-supplied business logic for one task type. Only
//! [`Worker::task_type`] and [`Worker::execute`] are required; the remaining
//! behavior comes from [`WorkerDefaults`] and can be overridden per worker.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use taskrunner_schemas::{Task, TaskResult};

use crate::config::{property, PropertyResolver};

/// Poll interval used when no `pollInterval` property is set
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Business logic for one task type
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use taskrunner_schemas::{Task, TaskResult};
/// use taskrunner_worker::Worker;
///
/// struct Encode;
///
/// #[async_trait]
/// impl Worker for Encode {
///     fn task_type(&self) -> &str {
///         "encode"
///     }
///
///     async fn execute(&self, task: &Task) -> anyhow::Result<TaskResult> {
///         let mut result = TaskResult::completed(task);
///         result.add_output("codec", "h264");
///         Ok(result)
///     }
/// }
/// ```
#[async_trait]
pub trait Worker: Send + Sync {
    /// Task type this worker polls for
    fn task_type(&self) -> &str;

    /// Run the business logic
    ///
    /// An `Err` (or a panic) is reported to the orchestrator as a FAILED
    /// result carrying the error chain.
    async fn execute(&self, task: &Task) -> anyhow::Result<TaskResult>;

    /// Whether polling is suspended; consulted before every poll
    fn paused(&self, properties: &dyn PropertyResolver) -> bool {
        WorkerDefaults::paused(self.task_type(), properties)
    }

    /// Identity reported to the orchestrator as worker id
    fn identity(&self) -> String {
        WorkerDefaults::identity()
    }

    /// Period of the fixed-delay polling schedule
    fn poll_interval(&self, properties: &dyn PropertyResolver) -> Duration {
        WorkerDefaults::poll_interval(self.task_type(), properties)
    }

    /// Called once when a result could not be delivered
    fn on_error_update(&self, _task: &Task) {}

    /// Whether the server should extend the task lease while running
    fn lease_extend_enabled(&self) -> bool {
        false
    }
}

/// Default worker behavior, shared by every [`Worker`] implementation
pub struct WorkerDefaults;

impl WorkerDefaults {
    /// `paused` property for the task type, then `all`; false when unset
    pub fn paused(task_type: &str, properties: &dyn PropertyResolver) -> bool {
        properties.get_bool(task_type, property::PAUSED, false)
    }

    /// Host identity, resolved once per process
    ///
    /// Checks `HOSTNAME`, `COMPUTERNAME` and `USER` in order, falling back
    /// to `"unknown"`.
    pub fn identity() -> String {
        static IDENTITY: OnceLock<String> = OnceLock::new();
        IDENTITY
            .get_or_init(|| {
                ["HOSTNAME", "COMPUTERNAME", "USER"]
                    .iter()
                    .filter_map(|key| std::env::var(key).ok())
                    .find(|value| !value.trim().is_empty())
                    .unwrap_or_else(|| "unknown".to_string())
            })
            .clone()
    }

    /// `pollInterval` property in milliseconds; [`DEFAULT_POLL_INTERVAL`] when unset
    pub fn poll_interval(task_type: &str, properties: &dyn PropertyResolver) -> Duration {
        let default = DEFAULT_POLL_INTERVAL.as_millis() as u64;
        Duration::from_millis(properties.get_u64(task_type, property::POLL_INTERVAL, default))
    }
}

/// Worker backed by an async closure
///
/// Built with [`worker_fn`].
pub struct FnWorker<F> {
    task_type: String,
    handler: F,
    identity: Option<String>,
    poll_interval: Option<Duration>,
}

/// Create a worker from a task type and an async closure
///
/// ```
/// use taskrunner_schemas::TaskResult;
/// use taskrunner_worker::{worker_fn, Worker};
///
/// let worker = worker_fn("notify", |task| async move { Ok(TaskResult::completed(&task)) });
/// assert_eq!(worker.task_type(), "notify");
/// ```
pub fn worker_fn<F, Fut>(task_type: impl Into<String>, handler: F) -> FnWorker<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<TaskResult>> + Send + 'static,
{
    FnWorker {
        task_type: task_type.into(),
        handler,
        identity: None,
        poll_interval: None,
    }
}

impl<F> FnWorker<F> {
    /// Report a fixed identity instead of the host identity
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Use a fixed poll interval instead of the `pollInterval` property
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }
}

#[async_trait]
impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<TaskResult>> + Send + 'static,
{
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn execute(&self, task: &Task) -> anyhow::Result<TaskResult> {
        (self.handler)(task.clone()).await
    }

    fn identity(&self) -> String {
        self.identity.clone().unwrap_or_else(WorkerDefaults::identity)
    }

    fn poll_interval(&self, properties: &dyn PropertyResolver) -> Duration {
        self.poll_interval
            .unwrap_or_else(|| WorkerDefaults::poll_interval(&self.task_type, properties))
    }
}
