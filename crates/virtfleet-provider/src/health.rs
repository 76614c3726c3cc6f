//! Provider health checking.
//!
//! A [`HealthChecker`] runs up to three independent checks against a host:
//!
//! - **SSH**: run a trivial command over the provider's shell
//! - **API**: reach the backend API endpoint (any response below 500 counts)
//! - **Service**: `systemctl is-active` for each configured unit
//!
//! Results are kept per check so a partial failure says which subsystem is
//! down. The overall status is [`aggregate`]d from the configured checks only.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use virtfleet_store::{CheckStatus, ExecutionRule, Provider, ProviderKind, ProviderStatus, ResourceFacts};

use crate::api::host_for_url;
use crate::error::{truncate, ProviderError, Result};
use crate::transport::RemoteShell;

/// Overall health of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No checks configured.
    #[default]
    Unknown,
    /// Every configured check passed.
    Healthy,
    /// Every configured check failed.
    Unhealthy,
    /// Some configured checks failed.
    Partial,
}

impl HealthStatus {
    /// Provider status implied by this health, `None` meaning "leave as is".
    #[must_use]
    pub const fn provider_status(self) -> Option<ProviderStatus> {
        match self {
            Self::Healthy => Some(ProviderStatus::Active),
            Self::Partial => Some(ProviderStatus::Partial),
            Self::Unhealthy => Some(ProviderStatus::Inactive),
            Self::Unknown => None,
        }
    }
}

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    /// Check status.
    pub status: CheckStatus,
    /// Error text when offline.
    pub error: Option<String>,
    /// Time spent on the check in milliseconds.
    pub duration_ms: u64,
}

impl CheckOutcome {
    /// A check that is not configured.
    #[must_use]
    pub const fn unconfigured() -> Self {
        Self {
            status: CheckStatus::Unconfigured,
            error: None,
            duration_ms: 0,
        }
    }

    fn from_result(result: std::result::Result<(), String>, started: Instant) -> Self {
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match result {
            Ok(()) => Self {
                status: CheckStatus::Online,
                error: None,
                duration_ms,
            },
            Err(error) => Self {
                status: CheckStatus::Offline,
                error: Some(error),
                duration_ms,
            },
        }
    }

    /// Returns true if the check passed.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status == CheckStatus::Online
    }
}

/// Result of a full health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResult {
    /// Aggregated status.
    pub status: HealthStatus,
    /// SSH check.
    pub ssh: CheckOutcome,
    /// API check.
    pub api: CheckOutcome,
    /// Service check.
    pub service: CheckOutcome,
    /// When the check started.
    pub checked_at: DateTime<Utc>,
    /// Total time in milliseconds.
    pub duration_ms: u64,
    /// `"<check>: <error>"` for every failed check.
    pub errors: Vec<String>,
    /// Static facts, when harvested during this check.
    pub resource_info: Option<ResourceFacts>,
}

impl HealthResult {
    /// Assemble a result from individual outcomes.
    #[must_use]
    pub fn from_checks(
        ssh: CheckOutcome,
        api: CheckOutcome,
        service: CheckOutcome,
        checked_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let status = aggregate(&[ssh.status, api.status, service.status]);
        let errors = [("ssh", &ssh), ("api", &api), ("service", &service)]
            .iter()
            .filter_map(|(name, outcome)| outcome.error.as_ref().map(|e| format!("{name}: {e}")))
            .collect();
        Self {
            status,
            ssh,
            api,
            service,
            checked_at,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            errors,
            resource_info: None,
        }
    }
}

/// Combine check statuses: healthy iff all configured pass, unhealthy iff
/// all fail, partial otherwise, unknown if none is configured.
#[must_use]
pub fn aggregate(checks: &[CheckStatus]) -> HealthStatus {
    let configured = checks
        .iter()
        .filter(|s| matches!(s, CheckStatus::Online | CheckStatus::Offline))
        .count();
    let online = checks.iter().filter(|s| **s == CheckStatus::Online).count();

    if configured == 0 {
        HealthStatus::Unknown
    } else if online == configured {
        HealthStatus::Healthy
    } else if online == 0 {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Partial
    }
}

/// Which checks run and how.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Run the SSH check.
    pub ssh_enabled: bool,
    /// Run the API check.
    pub api_enabled: bool,
    /// `http` or `https`.
    pub api_scheme: String,
    /// API port.
    pub api_port: u16,
    /// Path requested by the API check.
    pub api_path: String,
    /// Skip TLS verification for the API check.
    pub skip_tls_verify: bool,
    /// Systemd units that must be active.
    pub services: Vec<String>,
    /// Per-check timeout.
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ssh_enabled: true,
            api_enabled: false,
            api_scheme: "https".to_string(),
            api_port: 8443,
            api_path: "/".to_string(),
            skip_tls_verify: true,
            services: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl HealthConfig {
    /// Derive the check configuration of a provider.
    #[must_use]
    pub fn for_provider(provider: &Provider) -> Self {
        let api_port = provider.effective_api_port();
        let api_path = match provider.kind {
            ProviderKind::Proxmox => "/api2/json/version",
            ProviderKind::Lxd | ProviderKind::Incus => "/1.0",
            ProviderKind::Docker => "/",
        };
        Self {
            ssh_enabled: provider.execution_rule != ExecutionRule::ApiOnly
                || provider.kind == ProviderKind::Docker,
            api_enabled: api_port.is_some() && provider.execution_rule != ExecutionRule::SshOnly,
            api_scheme: "https".to_string(),
            api_port: api_port.unwrap_or_default(),
            api_path: api_path.to_string(),
            skip_tls_verify: provider.api_skip_tls_verify,
            services: provider.effective_services(),
            timeout: Duration::from_secs(provider.ssh_connect_timeout_secs.max(1)),
        }
    }
}

/// Runs the configured checks against one host.
pub struct HealthChecker {
    config: HealthConfig,
    host: String,
    shell: Option<Arc<dyn RemoteShell>>,
    http: reqwest::Client,
}

/// Harvests CPU cores, memory, swap, root disk, architecture, and uptime.
const FACTS_COMMAND: &str = "nproc; \
free -m | awk '/^Mem:/{print $2} /^Swap:/{print $2}'; \
df -m / | awk 'NR==2{print $2}'; \
uname -m; \
cut -d' ' -f1 /proc/uptime";

impl HealthChecker {
    /// Create a checker for `host`; SSH and service checks need a `shell`.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::InvalidConfig` if the HTTP client cannot be built.
    pub fn new(config: HealthConfig, host: impl Into<String>, shell: Option<Arc<dyn RemoteShell>>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.skip_tls_verify)
            .build()
            .map_err(|e| ProviderError::InvalidConfig(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            config,
            host: host.into(),
            shell,
            http,
        })
    }

    /// Build the checker of a provider around its shell.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::InvalidConfig` if the HTTP client cannot be built.
    pub fn for_provider(provider: &Provider, shell: Arc<dyn RemoteShell>) -> Result<Self> {
        Self::new(
            HealthConfig::for_provider(provider),
            provider.endpoint_host(),
            Some(shell),
        )
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Run all configured checks.
    ///
    /// When `collect_resources` is set and SSH succeeds, static facts are
    /// harvested into `resource_info`.
    pub async fn check_health(&self, collect_resources: bool) -> HealthResult {
        let checked_at = Utc::now();
        let started = Instant::now();

        let ((ssh, service, facts), api) = tokio::join!(self.ssh_and_services(collect_resources), self.check_api());

        let mut result = HealthResult::from_checks(ssh, api, service, checked_at, started.elapsed());
        result.resource_info = facts;

        debug!(
            host = %self.host,
            status = ?result.status,
            ssh = ?result.ssh.status,
            api = ?result.api.status,
            service = ?result.service.status,
            "Health check complete"
        );
        result
    }

    async fn ssh_and_services(&self, collect_resources: bool) -> (CheckOutcome, CheckOutcome, Option<ResourceFacts>) {
        let ssh = self.check_ssh().await;
        let service = self.check_services(ssh.status).await;
        let facts = if collect_resources && ssh.is_online() {
            self.collect_facts().await
        } else {
            None
        };
        (ssh, service, facts)
    }

    async fn check_ssh(&self) -> CheckOutcome {
        let Some(shell) = self.shell.as_ref().filter(|_| self.config.ssh_enabled) else {
            return CheckOutcome::unconfigured();
        };
        let started = Instant::now();
        let result = match shell.run("echo ok", self.config.timeout).await {
            Ok(output) if output.success() && output.stdout.trim() == "ok" => Ok(()),
            Ok(output) => Err(format!("unexpected probe output: {}", truncate(output.stderr.trim(), 200))),
            Err(e) => Err(e.to_string()),
        };
        CheckOutcome::from_result(result, started)
    }

    async fn check_api(&self) -> CheckOutcome {
        if !self.config.api_enabled {
            return CheckOutcome::unconfigured();
        }
        let started = Instant::now();
        let url = format!(
            "{}://{}:{}{}",
            self.config.api_scheme,
            host_for_url(&self.host),
            self.config.api_port,
            self.config.api_path
        );
        let result = match self.http.get(&url).send().await {
            Ok(response) if response.status().as_u16() < 500 => Ok(()),
            Ok(response) => Err(format!("HTTP {}", response.status())),
            Err(e) => Err(e.to_string()),
        };
        CheckOutcome::from_result(result, started)
    }

    async fn check_services(&self, ssh_status: CheckStatus) -> CheckOutcome {
        let Some(shell) = self.shell.as_ref() else {
            return CheckOutcome::unconfigured();
        };
        if self.config.services.is_empty() {
            return CheckOutcome::unconfigured();
        }
        let started = Instant::now();
        if ssh_status == CheckStatus::Offline {
            return CheckOutcome::from_result(Err("ssh unavailable".to_string()), started);
        }

        let mut inactive = Vec::new();
        for unit in &self.config.services {
            let command = format!("systemctl is-active {unit}");
            match shell.run(&command, self.config.timeout).await {
                Ok(output) if output.stdout.trim() == "active" => {}
                Ok(output) => inactive.push(format!("{unit}={}", output.stdout.trim())),
                Err(e) => inactive.push(format!("{unit}: {e}")),
            }
        }
        let result = if inactive.is_empty() {
            Ok(())
        } else {
            Err(format!("inactive services: {}", inactive.join(", ")))
        };
        CheckOutcome::from_result(result, started)
    }

    async fn collect_facts(&self) -> Option<ResourceFacts> {
        let shell = self.shell.as_ref()?;
        match shell.run(FACTS_COMMAND, self.config.timeout).await {
            Ok(output) if output.success() => parse_facts(&output.stdout),
            Ok(output) => {
                debug!(host = %self.host, stderr = %truncate(&output.stderr, 200), "Resource collection failed");
                None
            }
            Err(e) => {
                debug!(host = %self.host, error = %e, "Resource collection failed");
                None
            }
        }
    }
}

/// Parse the output of the facts command.
///
/// Expects, one per line: cores, memory MB, swap MB, disk MB, architecture,
/// uptime seconds (fractional).
#[must_use]
pub fn parse_facts(output: &str) -> Option<ResourceFacts> {
    let lines: Vec<&str> = output.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if lines.len() < 6 {
        return None;
    }
    let uptime = lines[5].split('.').next().unwrap_or("0");
    Some(ResourceFacts {
        cpu_cores: lines[0].parse().ok()?,
        memory_mb: lines[1].parse().ok()?,
        swap_mb: lines[2].parse().ok()?,
        disk_mb: lines[3].parse().ok()?,
        architecture: lines[4].to_string(),
        uptime_secs: uptime.parse().unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockShell;
    use virtfleet_core::ProviderId;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ssh_only_config(services: Vec<String>) -> HealthConfig {
        HealthConfig {
            ssh_enabled: true,
            api_enabled: false,
            services,
            timeout: Duration::from_secs(2),
            ..HealthConfig::default()
        }
    }

    #[test]
    fn aggregation_rules() {
        use CheckStatus::{Offline, Online, Unconfigured};
        assert_eq!(aggregate(&[Online, Offline, Unconfigured]), HealthStatus::Partial);
        assert_eq!(aggregate(&[Online, Online, Online]), HealthStatus::Healthy);
        assert_eq!(aggregate(&[Online, Unconfigured, Unconfigured]), HealthStatus::Healthy);
        assert_eq!(aggregate(&[Offline, Offline, Unconfigured]), HealthStatus::Unhealthy);
        assert_eq!(aggregate(&[Unconfigured, Unconfigured, Unconfigured]), HealthStatus::Unknown);
    }

    #[test]
    fn health_maps_to_provider_status() {
        assert_eq!(HealthStatus::Healthy.provider_status(), Some(ProviderStatus::Active));
        assert_eq!(HealthStatus::Partial.provider_status(), Some(ProviderStatus::Partial));
        assert_eq!(HealthStatus::Unhealthy.provider_status(), Some(ProviderStatus::Inactive));
        assert_eq!(HealthStatus::Unknown.provider_status(), None);
    }

    #[test]
    fn parse_facts_output() {
        let facts = parse_facts("8\n15934\n2047\n100603\nx86_64\n123456.78\n").unwrap();
        assert_eq!(facts.cpu_cores, 8);
        assert_eq!(facts.memory_mb, 15934);
        assert_eq!(facts.swap_mb, 2047);
        assert_eq!(facts.disk_mb, 100_603);
        assert_eq!(facts.architecture, "x86_64");
        assert_eq!(facts.uptime_secs, 123_456);

        assert!(parse_facts("8\n").is_none());
    }

    #[tokio::test]
    async fn ssh_online_api_offline_is_partial() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let port = server.address().port();

        let shell = Arc::new(MockShell::new());
        shell.respond("echo ok", "ok\n");
        let config = HealthConfig {
            api_enabled: true,
            api_scheme: "http".into(),
            api_port: port,
            ..ssh_only_config(Vec::new())
        };
        let checker = HealthChecker::new(config, "127.0.0.1", Some(shell)).unwrap();

        let result = checker.check_health(false).await;
        assert_eq!(result.ssh.status, CheckStatus::Online);
        assert_eq!(result.api.status, CheckStatus::Offline);
        assert_eq!(result.service.status, CheckStatus::Unconfigured);
        assert_eq!(result.status, HealthStatus::Partial);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("api:"));
    }

    #[tokio::test]
    async fn api_client_errors_below_500_count_as_online() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let config = HealthConfig {
            ssh_enabled: false,
            api_enabled: true,
            api_scheme: "http".into(),
            api_port: server.address().port(),
            timeout: Duration::from_secs(2),
            ..HealthConfig::default()
        };
        let checker = HealthChecker::new(config, "127.0.0.1", None).unwrap();
        let result = checker.check_health(false).await;
        assert_eq!(result.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn inactive_service_is_reported_separately() {
        let shell = Arc::new(MockShell::new());
        shell.respond("echo ok", "ok\n");
        shell.respond("systemctl is-active docker", "inactive\n");
        let checker =
            HealthChecker::new(ssh_only_config(vec!["docker".into()]), "h", Some(shell)).unwrap();

        let result = checker.check_health(false).await;
        assert_eq!(result.ssh.status, CheckStatus::Online);
        assert_eq!(result.service.status, CheckStatus::Offline);
        assert_eq!(result.status, HealthStatus::Partial);
        assert!(result.service.error.as_deref().unwrap_or("").contains("docker=inactive"));
    }

    #[tokio::test]
    async fn unreachable_host_is_unhealthy() {
        let shell = Arc::new(MockShell::new());
        shell.set_offline(true);
        let checker =
            HealthChecker::new(ssh_only_config(vec!["docker".into()]), "h", Some(shell)).unwrap();

        let result = checker.check_health(true).await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.resource_info.is_none());
    }

    #[tokio::test]
    async fn facts_collected_only_on_request() {
        let shell = Arc::new(MockShell::new());
        shell.respond("echo ok", "ok\n");
        shell.respond("nproc", "4\n7900\n0\n50000\naarch64\n99.5\n");
        let checker = HealthChecker::new(ssh_only_config(Vec::new()), "h", Some(Arc::clone(&shell) as Arc<dyn RemoteShell>)).unwrap();

        let without = checker.check_health(false).await;
        assert!(without.resource_info.is_none());
        assert!(shell.commands_matching("nproc").is_empty());

        let with = checker.check_health(true).await;
        let facts = with.resource_info.unwrap();
        assert_eq!(facts.cpu_cores, 4);
        assert_eq!(facts.architecture, "aarch64");
    }

    #[test]
    fn docker_provider_config() {
        let provider = Provider::new(ProviderId::new(1), "d", ProviderKind::Docker, "10.0.0.2");
        let config = HealthConfig::for_provider(&provider);
        assert!(config.ssh_enabled);
        assert!(!config.api_enabled);
        assert_eq!(config.services, vec!["docker".to_string()]);
    }
}
