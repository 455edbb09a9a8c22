//! Runner configuration and per-task-type properties
//!
//! Two layers of configuration exist:
//! - [`TaskRunnerConfig`] - immutable assembly knobs validated at construction
//! - [`PropertyResolver`] - `(scope, property)` lookups consulted on every cycle,
//!   first for the task type and then for the [`ALL_WORKERS`] scope

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::reliability::RetryPolicy;

/// Default prefix for executor thread names
pub const DEFAULT_WORKER_NAME_PREFIX: &str = "workflow-worker-";

/// Default number of result delivery attempts
pub const DEFAULT_UPDATE_RETRY_COUNT: u32 = 3;

/// Default pause between result delivery attempts
pub const DEFAULT_SLEEP_WHEN_RETRY: Duration = Duration::from_millis(500);

/// Default bounded wait applied on shutdown before forcing cancellation
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Scope key consulted when a task type has no value of its own
pub const ALL_WORKERS: &str = "all";

/// Recognized property names
pub mod property {
    /// Task domain passed on poll
    pub const DOMAIN: &str = "domain";
    /// Cooperative poll suspension (boolean)
    pub const PAUSED: &str = "paused";
    /// Schedule period in milliseconds
    pub const POLL_INTERVAL: &str = "pollInterval";
}

/// Assembly configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use taskrunner_worker::TaskRunnerConfig;
///
/// let config = TaskRunnerConfig::new()
///     .with_thread_count(4)
///     .with_update_retry_count(5)
///     .with_sleep_when_retry(Duration::from_millis(250));
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.resolved_thread_count(2), 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRunnerConfig {
    /// Executor threads and admission permits; defaults to the number of workers
    #[serde(default)]
    pub thread_count: Option<usize>,

    /// Attempts for each phase of result delivery
    pub update_retry_count: u32,

    /// Prefix for executor thread names
    pub worker_name_prefix: String,

    /// Pause between result delivery attempts
    #[serde(with = "duration_millis")]
    pub sleep_when_retry: Duration,

    /// Bounded wait for in-flight work on shutdown
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Explicit delivery policy; replaces the fixed `sleep_when_retry` schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_retry: Option<RetryPolicy>,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            thread_count: None,
            update_retry_count: DEFAULT_UPDATE_RETRY_COUNT,
            worker_name_prefix: DEFAULT_WORKER_NAME_PREFIX.to_string(),
            sleep_when_retry: DEFAULT_SLEEP_WHEN_RETRY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            update_retry: None,
        }
    }
}

impl TaskRunnerConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `TASKRUNNER_THREAD_COUNT`: executor threads (default: number of workers)
    /// - `TASKRUNNER_UPDATE_RETRY_COUNT`: delivery attempts (default: 3)
    /// - `TASKRUNNER_WORKER_NAME_PREFIX`: thread name prefix (default: "workflow-worker-")
    /// - `TASKRUNNER_SLEEP_WHEN_RETRY_MS`: pause between attempts (default: 500)
    /// - `TASKRUNNER_SHUTDOWN_TIMEOUT_MS`: shutdown wait (default: 10000)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let thread_count = std::env::var("TASKRUNNER_THREAD_COUNT")
            .ok()
            .and_then(|s| s.parse().ok());

        let update_retry_count = std::env::var("TASKRUNNER_UPDATE_RETRY_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.update_retry_count);

        let worker_name_prefix = std::env::var("TASKRUNNER_WORKER_NAME_PREFIX")
            .unwrap_or(defaults.worker_name_prefix);

        let sleep_when_retry = std::env::var("TASKRUNNER_SLEEP_WHEN_RETRY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.sleep_when_retry);

        let shutdown_timeout = std::env::var("TASKRUNNER_SHUTDOWN_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.shutdown_timeout);

        Self {
            thread_count,
            update_retry_count,
            worker_name_prefix,
            sleep_when_retry,
            shutdown_timeout,
            update_retry: None,
        }
    }

    /// Set an explicit thread count (must be at least 1)
    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = Some(thread_count);
        self
    }

    /// Set the number of result delivery attempts
    pub fn with_update_retry_count(mut self, count: u32) -> Self {
        self.update_retry_count = count;
        self
    }

    /// Set the executor thread name prefix
    pub fn with_worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }

    /// Set the pause between result delivery attempts
    pub fn with_sleep_when_retry(mut self, delay: Duration) -> Self {
        self.sleep_when_retry = delay;
        self
    }

    /// Deliver results under `policy`, e.g. exponential backoff with jitter
    pub fn with_update_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.update_retry = Some(policy);
        self
    }

    /// Set the shutdown wait
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(count) = self.thread_count {
            if count < 1 {
                return Err(ConfigError::InvalidThreadCount(count));
            }
        }
        if self.update_retry_count < 1 {
            return Err(ConfigError::InvalidUpdateRetryCount);
        }
        if matches!(&self.update_retry, Some(policy) if policy.max_attempts < 1) {
            return Err(ConfigError::InvalidUpdateRetryCount);
        }
        Ok(())
    }

    /// Thread count to use for `worker_count` registered workers
    pub fn resolved_thread_count(&self, worker_count: usize) -> usize {
        self.thread_count.unwrap_or(worker_count)
    }

    /// Retry policy applied to each phase of result delivery
    pub fn update_retry_policy(&self) -> RetryPolicy {
        self.update_retry
            .clone()
            .unwrap_or_else(|| RetryPolicy::fixed(self.sleep_when_retry, self.update_retry_count))
    }
}

/// Source of per-scope properties
///
/// Implementations answer raw lookups; the provided methods add the
/// task-type-then-[`ALL_WORKERS`] fallback and typed parsing.
pub trait PropertyResolver: Send + Sync {
    /// Raw value for `property` in `scope`
    fn get(&self, scope: &str, property: &str) -> Option<String>;

    /// Value for the task type, falling back to the global scope
    fn resolve(&self, task_type: &str, property: &str) -> Option<String> {
        self.get(task_type, property)
            .or_else(|| self.get(ALL_WORKERS, property))
    }

    /// Boolean property, `default` when unset or unparsable
    fn get_bool(&self, task_type: &str, property: &str, default: bool) -> bool {
        match self.resolve(task_type, property) {
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                other => {
                    warn!(task_type, property, value = other, "Ignoring non-boolean property");
                    default
                }
            },
            None => default,
        }
    }

    /// Unsigned integer property, `default` when unset or unparsable
    fn get_u64(&self, task_type: &str, property: &str, default: u64) -> u64 {
        match self.resolve(task_type, property) {
            Some(value) => value.trim().parse().unwrap_or_else(|_| {
                warn!(task_type, property, value = %value, "Ignoring non-numeric property");
                default
            }),
            None => default,
        }
    }
}

/// Properties read from environment variables
///
/// `(scope, property)` maps to `<PREFIX>_<SCOPE>_<PROPERTY>` in upper snake
/// case, so `("image-resize", "pollInterval")` is read from
/// `TASKRUNNER_WORKER_IMAGE_RESIZE_POLL_INTERVAL` and `("all", "domain")`
/// from `TASKRUNNER_WORKER_ALL_DOMAIN`.
#[derive(Debug, Clone)]
pub struct EnvProperties {
    prefix: String,
}

impl Default for EnvProperties {
    fn default() -> Self {
        Self {
            prefix: "TASKRUNNER_WORKER".to_string(),
        }
    }
}

impl EnvProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different variable prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Environment variable consulted for `(scope, property)`
    pub fn env_key(&self, scope: &str, property: &str) -> String {
        format!(
            "{}_{}_{}",
            self.prefix,
            upper_snake(scope),
            upper_snake(property)
        )
    }
}

impl PropertyResolver for EnvProperties {
    fn get(&self, scope: &str, property: &str) -> Option<String> {
        std::env::var(self.env_key(scope, property)).ok()
    }
}

fn upper_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && prev_lower {
                out.push('_');
            }
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
            out.push(c.to_ascii_uppercase());
        } else {
            if !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    out
}

/// In-memory properties, mutable at runtime
///
/// Useful for tests and for integrators that pause workers from an admin
/// endpoint without restarting the process.
#[derive(Debug, Default)]
pub struct StaticProperties {
    values: RwLock<HashMap<(String, String), String>>,
}

impl StaticProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(self, scope: &str, property: &str, value: impl Into<String>) -> Self {
        self.set(scope, property, value);
        self
    }

    /// Set or replace a value
    pub fn set(&self, scope: &str, property: &str, value: impl Into<String>) {
        self.values
            .write()
            .insert((scope.to_string(), property.to_string()), value.into());
    }

    /// Remove a value, returning the previous one
    pub fn remove(&self, scope: &str, property: &str) -> Option<String> {
        self.values
            .write()
            .remove(&(scope.to_string(), property.to_string()))
    }
}

impl PropertyResolver for StaticProperties {
    fn get(&self, scope: &str, property: &str) -> Option<String> {
        self.values
            .read()
            .get(&(scope.to_string(), property.to_string()))
            .cloned()
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TaskRunnerConfig::default();
        assert_eq!(config.thread_count, None);
        assert_eq!(config.update_retry_count, 3);
        assert_eq!(config.worker_name_prefix, "workflow-worker-");
        assert_eq!(config.sleep_when_retry, Duration::from_millis(500));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_thread_count_defaults_to_worker_count() {
        let config = TaskRunnerConfig::new();
        assert_eq!(config.resolved_thread_count(3), 3);
        assert_eq!(config.with_thread_count(8).resolved_thread_count(3), 8);
    }

    #[test]
    fn test_validation_rejects_zero_threads() {
        let config = TaskRunnerConfig::new().with_thread_count(0);
        assert_eq!(config.validate(), Err(ConfigError::InvalidThreadCount(0)));

        let config = TaskRunnerConfig::new().with_update_retry_count(0);
        assert_eq!(config.validate(), Err(ConfigError::InvalidUpdateRetryCount));
    }

    #[test]
    fn test_update_retry_policy_uses_fixed_delay() {
        let policy = TaskRunnerConfig::new()
            .with_update_retry_count(4)
            .with_sleep_when_retry(Duration::from_millis(20))
            .update_retry_policy();

        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(20));
    }

    #[test]
    fn test_explicit_update_retry_policy() {
        let backoff = RetryPolicy::exponential()
            .with_max_attempts(6)
            .with_initial_interval(Duration::from_millis(100))
            .with_jitter(0.0);
        let config = TaskRunnerConfig::new().with_update_retry_policy(backoff.clone());

        assert!(config.validate().is_ok());
        let policy = config.update_retry_policy();
        assert_eq!(policy, backoff);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));

        let json = serde_json::to_value(&config).unwrap();
        let parsed: TaskRunnerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.update_retry_policy(), backoff);

        let config = TaskRunnerConfig::new()
            .with_update_retry_policy(RetryPolicy::no_retry().with_max_attempts(0));
        assert_eq!(config.validate(), Err(ConfigError::InvalidUpdateRetryCount));
    }

    #[test]
    fn test_config_serialization_uses_millis() {
        let config = TaskRunnerConfig::new().with_thread_count(2);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["sleep_when_retry"], 500);
        assert_eq!(json["shutdown_timeout"], 10_000);

        let parsed: TaskRunnerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_resolve_falls_back_to_all_scope() {
        let props = StaticProperties::new()
            .with(ALL_WORKERS, property::DOMAIN, "shared")
            .with("encode", property::DOMAIN, "gpu");

        assert_eq!(props.resolve("encode", property::DOMAIN).as_deref(), Some("gpu"));
        assert_eq!(props.resolve("notify", property::DOMAIN).as_deref(), Some("shared"));
        assert_eq!(props.resolve("notify", property::PAUSED), None);
    }

    #[test]
    fn test_typed_accessors() {
        let props = StaticProperties::new()
            .with("encode", property::PAUSED, "TRUE")
            .with("encode", property::POLL_INTERVAL, "250")
            .with("resize", property::POLL_INTERVAL, "soon");

        assert!(props.get_bool("encode", property::PAUSED, false));
        assert!(!props.get_bool("resize", property::PAUSED, false));
        assert_eq!(props.get_u64("encode", property::POLL_INTERVAL, 1000), 250);
        assert_eq!(props.get_u64("resize", property::POLL_INTERVAL, 1000), 1000);

        props.set("notify", property::PAUSED, "maybe");
        assert!(props.get_bool("notify", property::PAUSED, true));
    }

    #[test]
    fn test_static_properties_are_mutable() {
        let props = StaticProperties::new();
        props.set("encode", property::PAUSED, "true");
        assert!(props.get_bool("encode", property::PAUSED, false));

        assert_eq!(props.remove("encode", property::PAUSED).as_deref(), Some("true"));
        assert!(!props.get_bool("encode", property::PAUSED, false));
    }

    #[test]
    fn test_env_keys() {
        let env = EnvProperties::new();
        assert_eq!(
            env.env_key("image-resize", property::POLL_INTERVAL),
            "TASKRUNNER_WORKER_IMAGE_RESIZE_POLL_INTERVAL"
        );
        assert_eq!(
            env.env_key(ALL_WORKERS, property::DOMAIN),
            "TASKRUNNER_WORKER_ALL_DOMAIN"
        );
        assert_eq!(
            EnvProperties::with_prefix("APP").env_key("sendEmail", property::PAUSED),
            "APP_SEND_EMAIL_PAUSED"
        );
    }

    #[test]
    fn test_env_properties_lookup() {
        let env = EnvProperties::with_prefix("TASKRUNNER_TEST_LOOKUP");
        std::env::set_var("TASKRUNNER_TEST_LOOKUP_ALL_DOMAIN", "blue");

        assert_eq!(env.resolve("encode", property::DOMAIN).as_deref(), Some("blue"));

        std::env::remove_var("TASKRUNNER_TEST_LOOKUP_ALL_DOMAIN");
        assert_eq!(env.resolve("encode", property::DOMAIN), None);
    }
}
