//! In-memory implementation of TaskClient for testing and local runs

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use taskrunner_schemas::{Task, TaskResult, TaskStatus};
use uuid::Uuid;

use super::TaskClient;
use crate::error::ClientError;

type QueueKey = (String, Option<String>);

/// In-memory orchestrator
///
/// Keeps one FIFO queue per `(task type, domain)` and records every update
/// it receives. Failures can be scripted per operation to exercise retry and
/// error paths.
///
/// # Example
///
/// ```
/// use taskrunner_schemas::Task;
/// use taskrunner_worker::InMemoryTaskClient;
///
/// let client = InMemoryTaskClient::new();
/// client.enqueue(Task::new("t-1", "encode"));
///
/// assert_eq!(client.pending("encode"), 1);
/// ```
#[derive(Default)]
pub struct InMemoryTaskClient {
    queues: Mutex<HashMap<QueueKey, VecDeque<Task>>>,
    updates: RwLock<Vec<TaskResult>>,
    external: RwLock<HashMap<String, Map<String, Value>>>,
    poll_delay: Option<Duration>,
    payload_threshold: Option<usize>,
    polls: AtomicUsize,
    update_calls: AtomicUsize,
    payload_calls: AtomicUsize,
    poll_failures: AtomicU32,
    update_failures: AtomicU32,
    payload_failures: AtomicU32,
}

impl InMemoryTaskClient {
    /// Create an empty client
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every poll by `delay`, emulating a long-poll round trip
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = Some(delay);
        self
    }

    /// Move outputs larger than `bytes` (serialized) to external storage
    pub fn with_payload_threshold(mut self, bytes: usize) -> Self {
        self.payload_threshold = Some(bytes);
        self
    }

    /// Queue a task under its type and domain
    pub fn enqueue(&self, task: Task) {
        let key = (task.task_type.clone(), task.domain.clone());
        self.queues.lock().entry(key).or_default().push_back(task);
    }

    /// Fail the next `n` polls with a transport error
    pub fn fail_next_polls(&self, n: u32) {
        self.poll_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` updates with a server error
    pub fn fail_next_updates(&self, n: u32) {
        self.update_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` payload evaluations
    pub fn fail_next_payload_evaluations(&self, n: u32) {
        self.payload_failures.store(n, Ordering::SeqCst);
    }

    /// Results delivered so far, in arrival order
    pub fn updates(&self) -> Vec<TaskResult> {
        self.updates.read().clone()
    }

    /// Delivered result for a task id, latest first
    pub fn update_for(&self, task_id: &str) -> Option<TaskResult> {
        self.updates
            .read()
            .iter()
            .rev()
            .find(|r| r.task_id == task_id)
            .cloned()
    }

    /// Number of poll calls, successful or not
    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Number of update calls, successful or not
    pub fn update_count(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Number of payload evaluation calls, successful or not
    pub fn payload_evaluation_count(&self) -> usize {
        self.payload_calls.load(Ordering::SeqCst)
    }

    /// Tasks still queued for a type across all domains
    pub fn pending(&self, task_type: &str) -> usize {
        self.queues
            .lock()
            .iter()
            .filter(|((ty, _), _)| ty == task_type)
            .map(|(_, queue)| queue.len())
            .sum()
    }

    /// Output stored externally under `path`
    pub fn external_payload(&self, path: &str) -> Option<Map<String, Value>> {
        self.external.read().get(path).cloned()
    }

    /// Consume one scripted failure if any remain
    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TaskClient for InMemoryTaskClient {
    async fn poll_task(
        &self,
        task_type: &str,
        worker_id: &str,
        domain: Option<&str>,
    ) -> Result<Option<Task>, ClientError> {
        self.polls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.poll_delay {
            tokio::time::sleep(delay).await;
        }

        if Self::take_failure(&self.poll_failures) {
            return Err(ClientError::Transport("connection refused".to_string()));
        }

        let key = (task_type.to_string(), domain.map(str::to_string));
        let task = self
            .queues
            .lock()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);

        Ok(task.map(|mut task| {
            task.status = TaskStatus::InProgress;
            task.worker_id = Some(worker_id.to_string());
            task.poll_count += 1;
            task
        }))
    }

    async fn evaluate_and_upload_large_payload(
        &self,
        mut result: TaskResult,
        _task_type: &str,
    ) -> Result<TaskResult, ClientError> {
        self.payload_calls.fetch_add(1, Ordering::SeqCst);

        if Self::take_failure(&self.payload_failures) {
            return Err(ClientError::Payload("external storage unavailable".to_string()));
        }

        let Some(threshold) = self.payload_threshold else {
            return Ok(result);
        };

        let size = serde_json::to_vec(&result.output_data)?.len();
        if size > threshold {
            let path = format!("task/output/{}.json", Uuid::now_v7());
            let output = std::mem::take(&mut result.output_data);
            self.external.write().insert(path.clone(), output);
            result.external_output_payload_storage_path = Some(path);
        }

        Ok(result)
    }

    async fn update_task(&self, result: &TaskResult) -> Result<(), ClientError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);

        if Self::take_failure(&self.update_failures) {
            return Err(ClientError::Server {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }

        self.updates.write().push(result.clone());
        Ok(())
    }
}
