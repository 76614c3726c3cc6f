//! Scheduler configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the periodic loops and the service binary.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Seconds between health rounds.
    pub health_interval_secs: u64,
    /// Seconds between maintenance rounds.
    pub maintenance_interval_secs: u64,
    /// Seconds between task timeout sweeps.
    pub timeout_sweep_interval_secs: u64,
    /// Seconds between traffic syncs.
    pub traffic_interval_secs: u64,
    /// Hours without an active health result before claims are blocked.
    pub provider_inactive_hours: u64,
    /// Providers checked at once during a health round.
    pub health_concurrency: usize,
    /// HTTP listen address.
    pub listen_addr: String,
    /// `RocksDB` directory.
    pub data_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 180,
            maintenance_interval_secs: 300,
            timeout_sweep_interval_secs: 60,
            traffic_interval_secs: 300,
            provider_inactive_hours: 72,
            health_concurrency: 16,
            listen_addr: "0.0.0.0:8080".to_string(),
            data_dir: PathBuf::from("./data/virtfleet"),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|n| *n > 0)
}

impl SchedulerConfig {
    /// Load configuration from environment variables.
    ///
    /// Reads:
    /// - `HEALTH_INTERVAL_SECS`
    /// - `MAINTENANCE_INTERVAL_SECS`
    /// - `TIMEOUT_SWEEP_INTERVAL_SECS`
    /// - `TRAFFIC_INTERVAL_SECS`
    /// - `PROVIDER_INACTIVE_HOURS`
    /// - `HEALTH_CONCURRENCY`
    /// - `LISTEN_ADDR`
    /// - `DATA_DIR`
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_u64("HEALTH_INTERVAL_SECS") {
            config.health_interval_secs = n;
        }
        if let Some(n) = env_u64("MAINTENANCE_INTERVAL_SECS") {
            config.maintenance_interval_secs = n;
        }
        if let Some(n) = env_u64("TIMEOUT_SWEEP_INTERVAL_SECS") {
            config.timeout_sweep_interval_secs = n;
        }
        if let Some(n) = env_u64("TRAFFIC_INTERVAL_SECS") {
            config.traffic_interval_secs = n;
        }
        if let Some(n) = env_u64("PROVIDER_INACTIVE_HOURS") {
            config.provider_inactive_hours = n;
        }
        if let Some(n) = env_u64("HEALTH_CONCURRENCY") {
            config.health_concurrency = usize::try_from(n).unwrap_or(config.health_concurrency);
        }
        if let Ok(val) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = val;
        }
        if let Ok(val) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        config
    }

    /// Health round interval.
    #[must_use]
    pub const fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    /// Maintenance round interval.
    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Timeout sweep interval.
    #[must_use]
    pub const fn timeout_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.timeout_sweep_interval_secs)
    }

    /// Traffic sync interval.
    #[must_use]
    pub const fn traffic_interval(&self) -> Duration {
        Duration::from_secs(self.traffic_interval_secs)
    }

    /// Inactivity window before a provider stops accepting claims.
    #[must_use]
    pub fn provider_inactive_after(&self) -> chrono::Duration {
        i64::try_from(self.provider_inactive_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }
}
