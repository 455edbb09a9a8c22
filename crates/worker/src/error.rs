//! Error types shared across the automator

/// Errors raised by the orchestrator collaborators
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Network or connection failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Server answered with an error status
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    /// Payload could not be externalized or accepted
    #[error("payload error: {0}")]
    Payload(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The collaborator call panicked
    #[error("client call panicked: {0}")]
    Panicked(String),
}

/// Invalid assembly configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no. of threads cannot be less than 1, got {0}")]
    InvalidThreadCount(usize),

    #[error("at least one worker must be registered")]
    NoWorkers,

    #[error("update retry count cannot be less than 1")]
    InvalidUpdateRetryCount,
}

/// Errors surfaced by the runner lifecycle
#[derive(Debug, thiserror::Error)]
pub enum AutomatorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// `start` called on a runner that is already running
    #[error("task runner is already running")]
    AlreadyStarted,

    /// `start` called after `shutdown`
    #[error("task runner has been stopped")]
    Stopped,

    /// `start` called outside of a Tokio runtime
    #[error("no tokio runtime available to drive the polling schedules")]
    NoRuntime,

    /// Work submitted after the executor pool was shut down
    #[error("executor pool is shut down")]
    PoolUnavailable,

    #[error("failed to build executor runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
