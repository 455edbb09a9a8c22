//! # Worker Task Automator
//!
//! Leases tasks from a workflow orchestrator, runs worker business logic on
//! a bounded pool and reports results back, never holding more leased tasks
//! than there are threads to run them.
//!
//! ## Features
//!
//! - **Admission control**: a non-blocking permit is taken before every poll
//! - **Fixed-size executor**: named threads, panics reported and absorbed
//! - **Per-worker schedules**: fixed-delay polling at each worker's interval
//! - **Bounded delivery retry**: payload evaluation and update each retried
//! - **Graceful shutdown**: bounded drain, then forced cancellation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskRunner                            │
//! │  [schedule: encode] [schedule: resize] ... one per worker   │
//! └──────────────────────────────┬──────────────────────────────┘
//!                                │ cycle(worker)
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TaskCycleExecutor                         │
//! │  discovery → paused → AdmissionGate::try_acquire → poll     │
//! └──────────────────────────────┬──────────────────────────────┘
//!                                │ submit(job + permit)
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutorPool                            │
//! │  execute → update with retry → release permit               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use taskrunner_worker::prelude::*;
//!
//! # async fn run(client: Arc<dyn TaskClient>) -> Result<(), Box<dyn std::error::Error>> {
//! let resize: Arc<dyn Worker> = Arc::new(worker_fn("image-resize", |task| async move {
//!     let mut result = TaskResult::completed(&task);
//!     result.add_output("width", 640);
//!     Ok(result)
//! }));
//!
//! let runner = TaskRunner::new(
//!     Collaborators::new(client).with_metrics(Arc::new(InMemoryMetrics::new())),
//!     vec![resize],
//!     TaskRunnerConfig::from_env(),
//! )?;
//!
//! runner.start()?;
//! tokio::signal::ctrl_c().await?;
//! runner.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod pool;
pub mod reliability;
pub mod runner;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::client::{DiscoveryClient, InMemoryTaskClient, StaticDiscovery, TaskClient};
    pub use crate::config::{EnvProperties, PropertyResolver, StaticProperties, TaskRunnerConfig};
    pub use crate::error::{AutomatorError, ClientError, ConfigError};
    pub use crate::executor::Collaborators;
    pub use crate::metrics::{InMemoryMetrics, NoopMetrics, WorkerMetrics};
    pub use crate::pool::ShutdownOutcome;
    pub use crate::runner::{RunnerState, TaskRunner};
    pub use crate::worker::{worker_fn, Worker};
    pub use taskrunner_schemas::{Task, TaskResult, TaskResultStatus, TaskStatus};
}

// Re-export main types
pub use admission::{AdmissionGate, Permit};
pub use client::{DiscoveryClient, InMemoryTaskClient, StaticDiscovery, TaskClient};
pub use config::{
    property, EnvProperties, PropertyResolver, StaticProperties, TaskRunnerConfig, ALL_WORKERS,
};
pub use error::{AutomatorError, ClientError, ConfigError};
pub use executor::{Collaborators, CycleOutcome, TaskCycleExecutor};
pub use metrics::{Counter, InMemoryMetrics, NoopMetrics, Timer, TimerSnapshot, WorkerMetrics};
pub use pool::{ExecutorPool, ShutdownOutcome, UncaughtPanicHandler};
pub use reliability::{retry, RetryPolicy};
pub use runner::{RunnerState, TaskRunner};
pub use worker::{worker_fn, FnWorker, Worker, WorkerDefaults, DEFAULT_POLL_INTERVAL};
