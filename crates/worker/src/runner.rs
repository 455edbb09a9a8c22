//! Runner assembly
//!
//! [`TaskRunner`] owns one fixed-delay polling schedule per registered
//! worker and the [`TaskCycleExecutor`] they share. Each schedule waits the
//! worker's poll interval, runs one cycle, and waits again; a cycle returns
//! right after dispatch, so slow tasks never stretch the polling cadence.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument};

use crate::config::TaskRunnerConfig;
use crate::error::{panic_message, AutomatorError, ConfigError};
use crate::executor::{Collaborators, TaskCycleExecutor};
use crate::pool::{drain, ShutdownOutcome};
use crate::worker::Worker;

/// Lifecycle of a [`TaskRunner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Constructed, schedules not started
    Created,
    /// Schedules are polling
    Running,
    /// Shut down; cannot be restarted
    Stopped,
}

/// Polls, executes and updates tasks for a set of workers
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use taskrunner_schemas::TaskResult;
/// use taskrunner_worker::{worker_fn, Collaborators, InMemoryTaskClient, TaskRunner, TaskRunnerConfig, Worker};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Arc::new(InMemoryTaskClient::new());
/// let encode: Arc<dyn Worker> =
///     Arc::new(worker_fn("encode", |task| async move { Ok(TaskResult::completed(&task)) }));
///
/// let runner = TaskRunner::new(
///     Collaborators::new(client),
///     vec![encode],
///     TaskRunnerConfig::new().with_thread_count(4),
/// )?;
///
/// runner.start()?;
/// // ...
/// runner.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct TaskRunner {
    collaborators: Collaborators,
    workers: Vec<Arc<dyn Worker>>,
    config: TaskRunnerConfig,
    thread_count: usize,
    state: Mutex<RunnerState>,
    executor: Mutex<Option<Arc<TaskCycleExecutor>>>,
    tracker: TaskTracker,
    stop: CancellationToken,
    force: CancellationToken,
}

impl TaskRunner {
    /// Validate the configuration and assemble a runner
    ///
    /// The thread count defaults to the number of workers.
    pub fn new(
        collaborators: Collaborators,
        workers: Vec<Arc<dyn Worker>>,
        config: TaskRunnerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if workers.is_empty() {
            return Err(ConfigError::NoWorkers);
        }

        let thread_count = config.resolved_thread_count(workers.len());

        Ok(Self {
            collaborators,
            workers,
            config,
            thread_count,
            state: Mutex::new(RunnerState::Created),
            executor: Mutex::new(None),
            tracker: TaskTracker::new(),
            stop: CancellationToken::new(),
            force: CancellationToken::new(),
        })
    }

    /// Build the executor and start one polling schedule per worker
    ///
    /// Must be called from within a Tokio runtime; the schedules run on it.
    #[instrument(skip(self), fields(workers = self.workers.len(), thread_count = self.thread_count))]
    pub fn start(&self) -> Result<(), AutomatorError> {
        let mut state = self.state.lock();
        match *state {
            RunnerState::Running => return Err(AutomatorError::AlreadyStarted),
            RunnerState::Stopped => return Err(AutomatorError::Stopped),
            RunnerState::Created => {}
        }

        let handle = Handle::try_current().map_err(|_| AutomatorError::NoRuntime)?;

        self.collaborators
            .metrics
            .increment_initialization("TaskRunner");

        let executor = Arc::new(TaskCycleExecutor::new(
            self.collaborators.clone(),
            self.thread_count,
            &self.config.worker_name_prefix,
            self.config.update_retry_policy(),
        )?);

        for worker in &self.workers {
            let interval = worker.poll_interval(&*self.collaborators.properties);
            self.tracker.spawn_on(
                run_schedule(
                    Arc::clone(&executor),
                    Arc::clone(worker),
                    interval,
                    self.stop.clone(),
                    self.force.clone(),
                ),
                &handle,
            );
        }

        *self.executor.lock() = Some(executor);
        *state = RunnerState::Running;

        info!(
            workers = self.workers.len(),
            thread_count = self.thread_count,
            update_retry_count = self.update_retry_count(),
            "Task runner started"
        );
        Ok(())
    }

    /// Stop polling and drain in-flight work
    ///
    /// Schedules get `shutdown_timeout` to finish their current cycle and
    /// the executor pool gets the same to finish running tasks; whatever
    /// remains after that is cancelled. Dropping this future early cancels
    /// immediately.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let executor = {
            let mut state = self.state.lock();
            let previous = std::mem::replace(&mut *state, RunnerState::Stopped);
            if previous != RunnerState::Running {
                debug!(?previous, "Task runner not running, nothing to shut down");
                return ShutdownOutcome::Drained;
            }
            self.executor.lock().take()
        };

        info!("Shutting down task runner");
        self.stop.cancel();
        self.tracker.close();

        let timeout = self.config.shutdown_timeout;
        let scheduling = drain(&self.tracker, &self.force, timeout, "polling schedules").await;
        let execution = match executor {
            Some(executor) => executor.shutdown(timeout).await,
            None => ShutdownOutcome::Drained,
        };

        let outcome = scheduling.and(execution);
        info!(?outcome, "Task runner stopped");
        outcome
    }

    pub fn state(&self) -> RunnerState {
        *self.state.lock()
    }

    /// Executor threads and admission permits
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Attempts per delivery phase
    pub fn update_retry_count(&self) -> u32 {
        self.config.update_retry_policy().max_attempts
    }

    pub fn worker_name_prefix(&self) -> &str {
        &self.config.worker_name_prefix
    }

    pub fn sleep_when_retry(&self) -> Duration {
        self.config.sleep_when_retry
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.config.shutdown_timeout
    }

    /// Free admission permits; `None` unless running
    pub fn available_permits(&self) -> Option<usize> {
        self.executor
            .lock()
            .as_ref()
            .map(|executor| executor.admission().available_permits())
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.stop.cancel();
        self.force.cancel();
    }
}

/// Fixed-delay schedule for one worker
async fn run_schedule(
    executor: Arc<TaskCycleExecutor>,
    worker: Arc<dyn Worker>,
    interval: Duration,
    stop: CancellationToken,
    force: CancellationToken,
) {
    let task_type = worker.task_type().to_string();
    debug!(%task_type, interval_ms = interval.as_millis() as u64, "Polling schedule started");

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        tokio::select! {
            _ = force.cancelled() => break,
            outcome = AssertUnwindSafe(executor.cycle(&worker)).catch_unwind() => {
                if let Err(payload) = outcome {
                    error!(
                        %task_type,
                        message = %panic_message(payload.as_ref()),
                        "Cycle panicked, schedule continues"
                    );
                }
            }
        }
    }

    debug!(%task_type, "Polling schedule stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryTaskClient;
    use crate::worker::worker_fn;
    use taskrunner_schemas::TaskResult;

    fn worker(task_type: &str) -> Arc<dyn Worker> {
        Arc::new(
            worker_fn(task_type.to_string(), |task| async move {
                Ok(TaskResult::completed(&task))
            })
            .with_poll_interval(Duration::from_millis(10)),
        )
    }

    fn collaborators() -> Collaborators {
        Collaborators::new(Arc::new(InMemoryTaskClient::new()))
    }

    #[test]
    fn test_rejects_empty_worker_set() {
        let result = TaskRunner::new(collaborators(), vec![], TaskRunnerConfig::new());
        assert!(matches!(result, Err(ConfigError::NoWorkers)));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = TaskRunner::new(
            collaborators(),
            vec![worker("encode")],
            TaskRunnerConfig::new().with_thread_count(0),
        );
        assert!(matches!(result, Err(ConfigError::InvalidThreadCount(0))));
    }

    #[test]
    fn test_thread_count_defaults_to_worker_count() {
        let runner = TaskRunner::new(
            collaborators(),
            vec![worker("a"), worker("b"), worker("c")],
            TaskRunnerConfig::new(),
        )
        .unwrap();

        assert_eq!(runner.thread_count(), 3);
        assert_eq!(runner.update_retry_count(), 3);
        assert_eq!(runner.worker_name_prefix(), "workflow-worker-");
        assert_eq!(runner.sleep_when_retry(), Duration::from_millis(500));
        assert_eq!(runner.state(), RunnerState::Created);
        assert_eq!(runner.available_permits(), None);
    }

    #[test]
    fn test_start_requires_runtime() {
        let runner =
            TaskRunner::new(collaborators(), vec![worker("encode")], TaskRunnerConfig::new())
                .unwrap();

        assert!(matches!(runner.start(), Err(AutomatorError::NoRuntime)));
        assert_eq!(runner.state(), RunnerState::Created);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let runner =
            TaskRunner::new(collaborators(), vec![worker("encode")], TaskRunnerConfig::new())
                .unwrap();

        runner.start().unwrap();
        assert_eq!(runner.state(), RunnerState::Running);
        assert_eq!(runner.available_permits(), Some(1));
        assert!(matches!(runner.start(), Err(AutomatorError::AlreadyStarted)));

        assert_eq!(runner.shutdown().await, ShutdownOutcome::Drained);
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert!(matches!(runner.start(), Err(AutomatorError::Stopped)));

        assert_eq!(runner.shutdown().await, ShutdownOutcome::Drained);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_noop() {
        let runner =
            TaskRunner::new(collaborators(), vec![worker("encode")], TaskRunnerConfig::new())
                .unwrap();

        assert_eq!(runner.shutdown().await, ShutdownOutcome::Drained);
        assert_eq!(runner.state(), RunnerState::Stopped);
    }
}
