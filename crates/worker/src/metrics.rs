//! Metrics collaborator
//!
//! The automator reports counters and timings through [`WorkerMetrics`];
//! the backend is up to the integrator. [`InMemoryMetrics`] keeps everything
//! in process and is what the tests assert against.

use std::time::Duration;

use dashmap::DashMap;

use crate::error::ClientError;

/// Sink for automator counters and timings
///
/// Every method defaults to a no-op so a backend only implements what it
/// exports.
pub trait WorkerMetrics: Send + Sync {
    /// Poll skipped because the worker is paused
    fn increment_paused(&self, _task_type: &str) {}

    /// A task was leased
    fn increment_poll(&self, _task_type: &str) {}

    /// Poll call failed
    fn increment_poll_error(&self, _task_type: &str, _error: &ClientError) {}

    /// Worker code returned an error or panicked
    fn increment_execution_error(&self, _task_type: &str, _error: &str) {}

    /// Result delivery exhausted its retry budget
    fn increment_update_error(&self, _task_type: &str, _error: &ClientError) {}

    /// A panic escaped every guard on an executor thread
    fn increment_uncaught(&self) {}

    /// A runner was started
    fn increment_initialization(&self, _component: &str) {}

    /// Latency of one poll call
    fn record_poll_time(&self, _task_type: &str, _elapsed: Duration) {}

    /// Latency of one `execute` call
    fn record_execution_time(&self, _task_type: &str, _elapsed: Duration) {}
}

/// Metrics sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl WorkerMetrics for NoopMetrics {}

/// Counter kinds tracked by [`InMemoryMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Paused,
    Poll,
    PollError,
    ExecutionError,
    UpdateError,
    Uncaught,
    Initialization,
}

/// Timer kinds tracked by [`InMemoryMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    Poll,
    Execution,
}

/// Aggregated samples for one timer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl TimerSnapshot {
    /// Mean sample, zero when empty
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.total.as_nanos() / u128::from(self.count)) as u64)
        }
    }
}

/// In-process metrics keyed by task type
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<(Counter, String), u64>,
    timers: DashMap<(Timer, String), TimerSnapshot>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter; process-wide counters use an empty key
    pub fn count(&self, counter: Counter, key: &str) -> u64 {
        self.counters
            .get(&(counter, key.to_string()))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Sum of a counter across all keys
    pub fn total(&self, counter: Counter) -> u64 {
        self.counters
            .iter()
            .filter(|entry| entry.key().0 == counter)
            .map(|entry| *entry.value())
            .sum()
    }

    /// Samples recorded for a timer
    pub fn timer(&self, timer: Timer, task_type: &str) -> TimerSnapshot {
        self.timers
            .get(&(timer, task_type.to_string()))
            .map(|v| *v)
            .unwrap_or_default()
    }

    fn bump(&self, counter: Counter, key: &str) {
        *self.counters.entry((counter, key.to_string())).or_insert(0) += 1;
    }

    fn sample(&self, timer: Timer, task_type: &str, elapsed: Duration) {
        let mut entry = self
            .timers
            .entry((timer, task_type.to_string()))
            .or_default();
        entry.count += 1;
        entry.total += elapsed;
        if elapsed > entry.max {
            entry.max = elapsed;
        }
    }
}

impl WorkerMetrics for InMemoryMetrics {
    fn increment_paused(&self, task_type: &str) {
        self.bump(Counter::Paused, task_type);
    }

    fn increment_poll(&self, task_type: &str) {
        self.bump(Counter::Poll, task_type);
    }

    fn increment_poll_error(&self, task_type: &str, _error: &ClientError) {
        self.bump(Counter::PollError, task_type);
    }

    fn increment_execution_error(&self, task_type: &str, _error: &str) {
        self.bump(Counter::ExecutionError, task_type);
    }

    fn increment_update_error(&self, task_type: &str, _error: &ClientError) {
        self.bump(Counter::UpdateError, task_type);
    }

    fn increment_uncaught(&self) {
        self.bump(Counter::Uncaught, "");
    }

    fn increment_initialization(&self, component: &str) {
        self.bump(Counter::Initialization, component);
    }

    fn record_poll_time(&self, task_type: &str, elapsed: Duration) {
        self.sample(Timer::Poll, task_type, elapsed);
    }

    fn record_execution_time(&self, task_type: &str, elapsed: Duration) {
        self.sample(Timer::Execution, task_type, elapsed);
    }
}
