// Task cycle executor
// Decision: Admission happens before the poll so a leased task always has a thread waiting for it
// Decision: Poll runs on the scheduling task; execute and update run on the executor pool
// Decision: Every failure after admission is absorbed here; cycle() never returns an error
//
// One cycle for one worker:
//   discovery up? -> paused? -> try_acquire -> poll -> submit job -> return
// The job then executes the worker, delivers the result with bounded retry
// and finally releases the permit.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use taskrunner_schemas::{Task, TaskResult, TaskResultStatus, TaskStatus};
use tracing::{debug, error, instrument};

use crate::admission::{AdmissionGate, Permit};
use crate::client::{DiscoveryClient, TaskClient};
use crate::config::{property, EnvProperties, PropertyResolver};
use crate::error::{panic_message, AutomatorError, ClientError};
use crate::metrics::{NoopMetrics, WorkerMetrics};
use crate::pool::{ExecutorPool, ShutdownOutcome, UncaughtPanicHandler};
use crate::reliability::{retry, RetryPolicy};
use crate::worker::Worker;

// =============================================================================
// Collaborators
// =============================================================================

/// External services the automator talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Orchestrator task API
    pub client: Arc<dyn TaskClient>,
    /// Liveness check; polling is unconditional when absent
    pub discovery: Option<Arc<dyn DiscoveryClient>>,
    /// Per-task-type properties
    pub properties: Arc<dyn PropertyResolver>,
    /// Metrics sink
    pub metrics: Arc<dyn WorkerMetrics>,
}

impl Collaborators {
    /// Collaborators with environment properties and no metrics
    pub fn new(client: Arc<dyn TaskClient>) -> Self {
        Self {
            client,
            discovery: None,
            properties: Arc::new(EnvProperties::new()),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoveryClient>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_properties(mut self, properties: Arc<dyn PropertyResolver>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn WorkerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

// =============================================================================
// TaskCycleExecutor
// =============================================================================

/// How a single cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Discovery reports the instance is not up
    NotUp,
    /// The worker is paused
    Paused,
    /// Every permit is in use
    AdmissionDenied,
    /// Poll returned no task, or a task with a blank id
    NoTask,
    /// Poll failed
    PollFailed,
    /// A task was leased and handed to the pool
    Dispatched,
    /// A task was leased but the pool is shut down
    Rejected,
}

/// Runs poll/execute/update cycles under a shared admission gate
pub struct TaskCycleExecutor {
    collaborators: Collaborators,
    gate: AdmissionGate,
    pool: ExecutorPool,
    update_retry: RetryPolicy,
}

impl TaskCycleExecutor {
    /// Create an executor with `thread_count` pool threads and permits
    pub fn new(
        collaborators: Collaborators,
        thread_count: usize,
        name_prefix: &str,
        update_retry: RetryPolicy,
    ) -> Result<Self, AutomatorError> {
        let metrics = Arc::clone(&collaborators.metrics);
        let on_panic: UncaughtPanicHandler = Arc::new(move |thread: &str, message: &str| {
            metrics.increment_uncaught();
            error!(thread, message, "Uncaught panic in executor thread");
        });

        let pool = ExecutorPool::new(thread_count, name_prefix, on_panic)?;

        Ok(Self {
            collaborators,
            gate: AdmissionGate::new(thread_count),
            pool,
            update_retry,
        })
    }

    /// Run one cycle for `worker`
    ///
    /// Returns once the task is dispatched; execution continues on the pool.
    #[instrument(level = "debug", skip_all, fields(task_type = %worker.task_type()))]
    pub async fn cycle(&self, worker: &Arc<dyn Worker>) -> CycleOutcome {
        let task_type = worker.task_type();
        let properties = &*self.collaborators.properties;
        let metrics = &self.collaborators.metrics;

        if let Some(discovery) = &self.collaborators.discovery {
            if !discovery.is_instance_up().await {
                debug!("Instance is not up in discovery, not polling");
                return CycleOutcome::NotUp;
            }
        }

        if worker.paused(properties) {
            metrics.increment_paused(task_type);
            debug!("Worker is paused, not polling");
            return CycleOutcome::Paused;
        }

        let Some(permit) = self.gate.try_acquire() else {
            debug!("No free permit, skipping poll");
            return CycleOutcome::AdmissionDenied;
        };

        let domain = properties.resolve(task_type, property::DOMAIN);
        let identity = worker.identity();
        debug!(domain = ?domain, %identity, "Polling for task");

        let started = Instant::now();
        let polled = AssertUnwindSafe(self.collaborators.client.poll_task(
            task_type,
            &identity,
            domain.as_deref(),
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(ClientError::Panicked(panic_message(payload.as_ref()))));
        metrics.record_poll_time(task_type, started.elapsed());

        let task = match polled {
            Ok(Some(task)) if !task.has_blank_id() => task,
            Ok(_) => {
                permit.release();
                debug!("No task available");
                return CycleOutcome::NoTask;
            }
            Err(err) => {
                permit.release();
                metrics.increment_poll_error(task_type, &err);
                error!(error = %err, "Error polling for task");
                return CycleOutcome::PollFailed;
            }
        };

        metrics.increment_poll(task_type);
        debug!(task_id = %task.task_id, domain = ?domain, %identity, "Polled task");

        let task_id = task.task_id.clone();
        let job = TaskJob {
            task,
            worker: Arc::clone(worker),
            client: Arc::clone(&self.collaborators.client),
            metrics: Arc::clone(metrics),
            update_retry: self.update_retry.clone(),
            identity,
        };

        // On refusal the job is dropped here, and its permit with it.
        match self.pool.submit(job.run(permit)) {
            Ok(()) => CycleOutcome::Dispatched,
            Err(err) => {
                error!(%task_id, error = %err, "Leased task could not be dispatched");
                CycleOutcome::Rejected
            }
        }
    }

    /// Close admission, then drain the pool for up to `timeout`
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        self.gate.close();
        self.pool.shutdown(timeout).await
    }

    /// Admission gate shared by all cycles
    pub fn admission(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn thread_count(&self) -> usize {
        self.pool.thread_count()
    }
}

// =============================================================================
// Task job
// =============================================================================

/// Everything one dispatched task needs on the pool
struct TaskJob {
    task: Task,
    worker: Arc<dyn Worker>,
    client: Arc<dyn TaskClient>,
    metrics: Arc<dyn WorkerMetrics>,
    update_retry: RetryPolicy,
    identity: String,
}

impl TaskJob {
    async fn run(mut self, permit: Permit) {
        let result = self.execute().await;
        self.update_with_retry(result).await;
        permit.release();
    }

    async fn execute(&mut self) -> TaskResult {
        let task_type = self.worker.task_type().to_string();
        debug!(task_id = %self.task.task_id, %task_type, identity = %self.identity, "Executing task");

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.worker.execute(&self.task))
            .catch_unwind()
            .await;
        self.metrics
            .record_execution_time(&task_type, started.elapsed());

        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => self.failed_result(&format!("{err:#}"), format!("{err:?}")),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.failed_result(&format!("worker panicked: {message}"), message)
            }
        };

        result.workflow_instance_id = self.task.workflow_instance_id.clone();
        result.task_id = self.task.task_id.clone();
        result.worker_id = Some(self.identity.clone());

        debug!(task_id = %self.task.task_id, status = %result.status, "Task executed");
        result
    }

    /// Mark the task FAILED and build the result reported in its place
    fn failed_result(&mut self, description: &str, trace: String) -> TaskResult {
        let task_type = self.worker.task_type();
        error!(task_id = %self.task.task_id, task_type, error = description, "Error while executing task");
        self.metrics.increment_execution_error(task_type, description);

        self.task.status = TaskStatus::Failed;
        let mut result = TaskResult::new(&self.task).with_status(TaskResultStatus::Failed);
        result.reason_for_incompletion = Some(format!("Error while executing the task: {description}"));
        result.log(trace);
        result
    }

    async fn update_with_retry(&self, result: TaskResult) {
        let task_type = self.worker.task_type();

        match self.deliver(&result, task_type).await {
            Ok(()) => debug!(task_id = %self.task.task_id, status = %result.status, "Task result delivered"),
            Err(err) => {
                self.worker.on_error_update(&self.task);
                self.metrics.increment_update_error(task_type, &err);
                error!(
                    task_id = %self.task.task_id,
                    task_type,
                    identity = %self.identity,
                    error = %err,
                    "Failed to update task result"
                );
            }
        }
    }

    /// Externalize the payload, then send the update; each phase has its own budget
    async fn deliver(&self, result: &TaskResult, task_type: &str) -> Result<(), ClientError> {
        let client = &self.client;
        let policy = &self.update_retry;

        let final_result = retry(policy, "evaluate task payload", move || {
            client.evaluate_and_upload_large_payload(result.clone(), task_type)
        })
        .await?;

        let final_result = &final_result;
        retry(policy, "update task", move || client.update_task(final_result)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{InMemoryTaskClient, StaticDiscovery};
    use crate::config::StaticProperties;
    use crate::metrics::{Counter, InMemoryMetrics};
    use crate::worker::worker_fn;

    struct Harness {
        client: Arc<InMemoryTaskClient>,
        metrics: Arc<InMemoryMetrics>,
        properties: Arc<StaticProperties>,
        discovery: Arc<StaticDiscovery>,
        executor: TaskCycleExecutor,
    }

    fn harness(thread_count: usize) -> Harness {
        let client = Arc::new(InMemoryTaskClient::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let properties = Arc::new(StaticProperties::new());
        let discovery = Arc::new(StaticDiscovery::new(true));
        let collaborators = Collaborators::new(client.clone())
            .with_discovery(discovery.clone())
            .with_properties(properties.clone())
            .with_metrics(metrics.clone());
        let executor = TaskCycleExecutor::new(
            collaborators,
            thread_count,
            "test-worker-",
            RetryPolicy::fixed(Duration::from_millis(5), 3),
        )
        .unwrap();

        Harness {
            client,
            metrics,
            properties,
            discovery,
            executor,
        }
    }

    fn completing(task_type: &str) -> Arc<dyn Worker> {
        Arc::new(
            worker_fn(task_type.to_string(), |task| async move {
                Ok(TaskResult::completed(&task))
            })
            .with_identity("host-1"),
        )
    }

    async fn wait_for_permits(executor: &TaskCycleExecutor, expected: usize) {
        for _ in 0..200 {
            if executor.admission().available_permits() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("permits never returned to {expected}");
    }

    #[tokio::test]
    async fn test_not_up_skips_everything() {
        let h = harness(1);
        h.discovery.set_up(false);
        h.client.enqueue(Task::new("t-1", "encode"));

        let outcome = h.executor.cycle(&completing("encode")).await;

        assert_eq!(outcome, CycleOutcome::NotUp);
        assert_eq!(h.client.poll_count(), 0);
        assert_eq!(h.metrics.count(Counter::Paused, "encode"), 0);
        assert_eq!(h.executor.admission().available_permits(), 1);
    }

    #[tokio::test]
    async fn test_paused_worker_counts_and_skips() {
        let h = harness(1);
        h.properties.set("encode", property::PAUSED, "true");

        let outcome = h.executor.cycle(&completing("encode")).await;

        assert_eq!(outcome, CycleOutcome::Paused);
        assert_eq!(h.metrics.count(Counter::Paused, "encode"), 1);
        assert_eq!(h.client.poll_count(), 0);
        assert_eq!(h.executor.admission().available_permits(), 1);
    }

    #[tokio::test]
    async fn test_empty_poll_releases_permit() {
        let h = harness(1);
        h.client.enqueue(Task::new("  ", "encode"));

        assert_eq!(h.executor.cycle(&completing("encode")).await, CycleOutcome::NoTask);
        assert_eq!(h.executor.cycle(&completing("encode")).await, CycleOutcome::NoTask);

        assert_eq!(h.client.poll_count(), 2);
        assert_eq!(h.executor.admission().available_permits(), 1);
        assert!(h.client.updates().is_empty());
        assert_eq!(h.metrics.count(Counter::Poll, "encode"), 0);
    }

    #[tokio::test]
    async fn test_poll_error_releases_permit() {
        let h = harness(1);
        h.client.fail_next_polls(1);

        let outcome = h.executor.cycle(&completing("encode")).await;

        assert_eq!(outcome, CycleOutcome::PollFailed);
        assert_eq!(h.metrics.count(Counter::PollError, "encode"), 1);
        assert_eq!(h.executor.admission().available_permits(), 1);
    }

    struct PanickingPollClient;

    #[async_trait::async_trait]
    impl TaskClient for PanickingPollClient {
        async fn poll_task(
            &self,
            _task_type: &str,
            _worker_id: &str,
            _domain: Option<&str>,
        ) -> Result<Option<Task>, ClientError> {
            panic!("poll boom")
        }

        async fn evaluate_and_upload_large_payload(
            &self,
            result: TaskResult,
            _task_type: &str,
        ) -> Result<TaskResult, ClientError> {
            Ok(result)
        }

        async fn update_task(&self, _result: &TaskResult) -> Result<(), ClientError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_poll_counts_as_poll_error() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let collaborators = Collaborators::new(Arc::new(PanickingPollClient))
            .with_properties(Arc::new(StaticProperties::new()))
            .with_metrics(metrics.clone());
        let executor = TaskCycleExecutor::new(
            collaborators,
            1,
            "test-worker-",
            RetryPolicy::fixed(Duration::from_millis(5), 3),
        )
        .unwrap();

        let outcome = executor.cycle(&completing("encode")).await;

        assert_eq!(outcome, CycleOutcome::PollFailed);
        assert_eq!(executor.admission().available_permits(), 1);
        assert_eq!(metrics.count(Counter::PollError, "encode"), 1);
        assert_eq!(metrics.count(Counter::Poll, "encode"), 0);
        assert_eq!(metrics.count(Counter::Uncaught, ""), 0);
    }

    #[tokio::test]
    async fn test_dispatched_task_is_completed_and_stamped() {
        let h = harness(2);
        h.client
            .enqueue(Task::new("t-1", "encode").with_workflow_instance_id("wf-1"));

        let outcome = h.executor.cycle(&completing("encode")).await;
        assert_eq!(outcome, CycleOutcome::Dispatched);

        wait_for_permits(&h.executor, 2).await;
        let result = h.client.update_for("t-1").unwrap();
        assert_eq!(result.status, TaskResultStatus::Completed);
        assert_eq!(result.workflow_instance_id, "wf-1");
        assert_eq!(result.worker_id.as_deref(), Some("host-1"));
        assert_eq!(h.metrics.count(Counter::Poll, "encode"), 1);
        assert_eq!(h.metrics.timer(crate::metrics::Timer::Execution, "encode").count, 1);
    }

    #[tokio::test]
    async fn test_execution_error_reports_failed_result() {
        let h = harness(1);
        h.client.enqueue(Task::new("t-1", "encode"));
        let worker: Arc<dyn Worker> = Arc::new(worker_fn("encode", |_task| async move {
            Err(anyhow::anyhow!("boom"))
        }));

        assert_eq!(h.executor.cycle(&worker).await, CycleOutcome::Dispatched);
        wait_for_permits(&h.executor, 1).await;

        let result = h.client.update_for("t-1").unwrap();
        assert_eq!(result.status, TaskResultStatus::Failed);
        assert!(result
            .reason_for_incompletion
            .as_deref()
            .unwrap()
            .contains("boom"));
        assert_eq!(result.logs.len(), 1);
        assert_eq!(h.metrics.count(Counter::ExecutionError, "encode"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_admission() {
        let h = harness(1);

        assert_eq!(h.executor.shutdown(Duration::from_secs(1)).await, ShutdownOutcome::Drained);
        assert_eq!(
            h.executor.cycle(&completing("encode")).await,
            CycleOutcome::AdmissionDenied
        );
        assert_eq!(h.client.poll_count(), 0);
    }
}
