//! Fixed-size executor for task jobs
//!
//! Jobs run on a dedicated multi-thread runtime with exactly `thread_count`
//! worker threads named `<prefix><ordinal>`. Every job is wrapped in
//! `catch_unwind`; a panic is reported to the [`UncaughtPanicHandler`] and
//! the thread keeps serving jobs.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{panic_message, AutomatorError, ConfigError};

/// Callback for panics that escape a job: `(thread name, panic message)`
pub type UncaughtPanicHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// How a bounded shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// All in-flight work finished within the timeout
    Drained,
    /// The timeout elapsed (or the wait was interrupted) and work was cancelled
    Forced,
}

impl ShutdownOutcome {
    /// Forced if either outcome was forced
    pub fn and(self, other: ShutdownOutcome) -> ShutdownOutcome {
        if self == ShutdownOutcome::Drained && other == ShutdownOutcome::Drained {
            ShutdownOutcome::Drained
        } else {
            ShutdownOutcome::Forced
        }
    }

    pub fn is_drained(&self) -> bool {
        *self == ShutdownOutcome::Drained
    }
}

/// Wait up to `timeout` for a closed tracker to empty, then cancel
///
/// Dropping the returned future before it completes cancels `cancel`, so an
/// interrupted shutdown forces cancellation immediately.
pub(crate) async fn drain(
    tracker: &TaskTracker,
    cancel: &CancellationToken,
    timeout: Duration,
    component: &str,
) -> ShutdownOutcome {
    let guard = cancel.clone().drop_guard();

    match tokio::time::timeout(timeout, tracker.wait()).await {
        Ok(()) => {
            guard.disarm();
            debug!(component, "All in-flight work completed");
            ShutdownOutcome::Drained
        }
        Err(_) => {
            warn!(
                component,
                timeout_ms = timeout.as_millis() as u64,
                remaining = tracker.len(),
                "Shutdown timeout reached, cancelling in-flight work"
            );
            drop(guard);
            ShutdownOutcome::Forced
        }
    }
}

/// Bounded pool executing task jobs
pub struct ExecutorPool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    tracker: TaskTracker,
    cancel: CancellationToken,
    on_panic: UncaughtPanicHandler,
    thread_count: usize,
}

impl ExecutorPool {
    /// Build the pool and its runtime
    pub fn new(
        thread_count: usize,
        name_prefix: &str,
        on_panic: UncaughtPanicHandler,
    ) -> Result<Self, AutomatorError> {
        if thread_count < 1 {
            return Err(ConfigError::InvalidThreadCount(thread_count).into());
        }

        let prefix = name_prefix.to_string();
        let ordinal = AtomicUsize::new(0);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(thread_count)
            .thread_name_fn(move || {
                format!("{}{}", prefix, ordinal.fetch_add(1, Ordering::SeqCst))
            })
            .enable_all()
            .build()?;

        info!(thread_count, name_prefix, "Executor pool started");

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            on_panic,
            thread_count,
        })
    }

    /// Queue a job on the pool
    ///
    /// Fails with [`AutomatorError::PoolUnavailable`] once shutdown began.
    pub fn submit<F>(&self, job: F) -> Result<(), AutomatorError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() || self.cancel.is_cancelled() {
            return Err(AutomatorError::PoolUnavailable);
        }

        let cancel = self.cancel.clone();
        let on_panic = Arc::clone(&self.on_panic);

        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Job cancelled by forced shutdown");
                    }
                    outcome = AssertUnwindSafe(job).catch_unwind() => {
                        if let Err(payload) = outcome {
                            let thread = std::thread::current();
                            let name = thread.name().unwrap_or("unnamed");
                            on_panic(name, &panic_message(payload.as_ref()));
                        }
                    }
                }
            },
            &self.handle,
        );

        Ok(())
    }

    /// Stop accepting jobs, wait up to `timeout` for running ones, then cancel
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        self.tracker.close();
        let outcome = drain(&self.tracker, &self.cancel, timeout, "executor pool").await;

        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }

        info!(?outcome, "Executor pool stopped");
        outcome
    }

    /// Jobs queued or running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn is_shutdown(&self) -> bool {
        self.tracker.is_closed()
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}
