//! Orchestrator collaborators
//!
//! This module provides:
//! - [`TaskClient`] - poll, payload externalization and result delivery
//! - [`DiscoveryClient`] - optional liveness check gating every poll
//! - [`InMemoryTaskClient`] / [`StaticDiscovery`] - in-process implementations
//!
//! The wire transport behind [`TaskClient`] is out of scope for this crate;
//! an HTTP or gRPC client implements the trait.

mod memory;

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use taskrunner_schemas::{Task, TaskResult};

use crate::error::ClientError;

pub use memory::InMemoryTaskClient;

/// Task operations exposed by the orchestrator
#[async_trait]
pub trait TaskClient: Send + Sync {
    /// Lease one task of `task_type`, `None` when nothing is available
    ///
    /// May long-poll on the server side.
    async fn poll_task(
        &self,
        task_type: &str,
        worker_id: &str,
        domain: Option<&str>,
    ) -> Result<Option<Task>, ClientError>;

    /// Return a result that is safe to transmit
    ///
    /// Oversized output is moved to external storage and replaced by a
    /// reference.
    async fn evaluate_and_upload_large_payload(
        &self,
        result: TaskResult,
        task_type: &str,
    ) -> Result<TaskResult, ClientError>;

    /// Deliver a result; idempotent from the caller's perspective
    async fn update_task(&self, result: &TaskResult) -> Result<(), ClientError>;
}

/// Service discovery status for this instance
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Whether this instance is up and should take traffic
    async fn is_instance_up(&self) -> bool;
}

/// Discovery status toggled in process
#[derive(Debug)]
pub struct StaticDiscovery {
    up: AtomicBool,
}

impl StaticDiscovery {
    pub fn new(up: bool) -> Self {
        Self {
            up: AtomicBool::new(up),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl DiscoveryClient for StaticDiscovery {
    async fn is_instance_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}
