//! Task engine configuration.

use std::time::Duration;

use virtfleet_provider::retry::DEFAULT_ATTEMPTS;

/// Configuration for the task engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Replaces the per-type default timeout for tasks created without one.
    pub default_timeout_secs: Option<u64>,
    /// Terminal tasks older than this many days are deleted by cleanup.
    pub retention_days: u32,
    /// Attempts for destructive backend calls on connectivity failures.
    pub retry_attempts: u32,
    /// Recorded on tasks this process runs.
    pub executor_id: String,
    /// Start the oldest pending task of a provider whenever a slot frees up.
    pub auto_dispatch: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: None,
            retention_days: 30,
            retry_attempts: DEFAULT_ATTEMPTS,
            executor_id: "virtfleet".to_string(),
            auto_dispatch: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Reads `TASK_DEFAULT_TIMEOUT_SECS`, `TASK_RETENTION_DAYS`,
    /// `RETRY_ATTEMPTS` and `EXECUTOR_ID`; unset or unparsable values keep
    /// their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_timeout_secs: std::env::var("TASK_DEFAULT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0),
            retention_days: std::env::var("TASK_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retention_days),
            retry_attempts: std::env::var("RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.retry_attempts),
            executor_id: std::env::var("EXECUTOR_ID").unwrap_or(defaults.executor_id),
            auto_dispatch: defaults.auto_dispatch,
        }
    }

    /// Retention window for terminal tasks.
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }

    /// Timeout override, if configured.
    #[must_use]
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }
}
