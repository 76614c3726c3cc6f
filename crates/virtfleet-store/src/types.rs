//! Domain types stored in the database.
//!
//! These types represent the persisted state of providers, instances, tasks,
//! and port mappings.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use virtfleet_core::{InstanceId, PortMappingId, ProviderId, TaskId};

// =============================================================================
// Providers
// =============================================================================

/// Virtualization backend family of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ProviderKind {
    /// Container-engine host.
    Docker = 1,
    /// LXD hypervisor host.
    Lxd = 2,
    /// Incus hypervisor host.
    Incus = 3,
    /// Proxmox VE node.
    Proxmox = 4,
}

impl ProviderKind {
    /// Lowercase backend name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Lxd => "lxd",
            Self::Incus => "incus",
            Self::Proxmox => "proxmox",
        }
    }

    /// Parse a backend name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "docker" => Some(Self::Docker),
            "lxd" => Some(Self::Lxd),
            "incus" => Some(Self::Incus),
            "proxmox" | "pve" => Some(Self::Proxmox),
            _ => None,
        }
    }

    /// Systemd units probed by the service health check when the provider
    /// does not configure its own list.
    #[must_use]
    pub fn default_services(self) -> Vec<String> {
        let units: &[&str] = match self {
            Self::Docker => &["docker"],
            Self::Lxd => &["snap.lxd.daemon"],
            Self::Incus => &["incus"],
            Self::Proxmox => &["pveproxy"],
        };
        units.iter().map(ToString::to_string).collect()
    }

    /// Default API port of the backend, if it has one.
    #[must_use]
    pub const fn default_api_port(self) -> Option<u16> {
        match self {
            Self::Docker => None,
            Self::Lxd | Self::Incus => Some(8443),
            Self::Proxmox => Some(8006),
        }
    }
}

/// How a provider may be driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionRule {
    /// Use the API when configured, otherwise SSH.
    #[default]
    Auto,
    /// Only the backend API may be used.
    ApiOnly,
    /// Only SSH may be used.
    SshOnly,
}

/// Network topology offered to instances on a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// Shared IPv4 behind NAT.
    #[default]
    NatIpv4,
    /// Shared IPv4 behind NAT plus IPv6.
    NatIpv4Ipv6,
    /// One public IPv4 per instance.
    DedicatedIpv4,
    /// One public IPv4 per instance plus IPv6.
    DedicatedIpv4Ipv6,
    /// IPv6 only.
    Ipv6Only,
}

impl NetworkType {
    /// Returns true if instances reach the outside through host port mappings.
    #[must_use]
    pub const fn uses_port_mappings(self) -> bool {
        matches!(self, Self::NatIpv4 | Self::NatIpv4Ipv6)
    }

    /// Returns true if the network offers IPv6.
    #[must_use]
    pub const fn has_ipv6(self) -> bool {
        matches!(
            self,
            Self::NatIpv4Ipv6 | Self::DedicatedIpv4Ipv6 | Self::Ipv6Only
        )
    }
}

/// Aggregated operational status of a provider, derived from health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ProviderStatus {
    /// Never checked.
    #[default]
    Unknown = 0,
    /// All configured checks pass.
    Active = 1,
    /// Some configured checks fail.
    Partial = 2,
    /// All configured checks fail.
    Inactive = 3,
}

/// Reachability of one health-check subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Not checked yet.
    #[default]
    Unknown,
    /// The check passed.
    Online,
    /// The check failed.
    Offline,
    /// The check is not configured for this provider.
    Unconfigured,
}

/// Secrets used to reach a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// SSH password.
    #[serde(default)]
    pub password: Option<String>,
    /// Path to an SSH private key on the orchestrator host.
    #[serde(default)]
    pub private_key_path: Option<String>,
    /// API token ID (Proxmox `user@realm!token`).
    #[serde(default)]
    pub api_token_id: Option<String>,
    /// API token secret.
    #[serde(default)]
    pub api_token_secret: Option<String>,
    /// Client certificate for LXD/Incus API access.
    #[serde(default)]
    pub cert_path: Option<String>,
    /// Client key for LXD/Incus API access.
    #[serde(default)]
    pub key_path: Option<String>,
}

impl Credentials {
    /// Returns true if an API token is configured.
    #[must_use]
    pub fn has_api_token(&self) -> bool {
        self.api_token_id.is_some() && self.api_token_secret.is_some()
    }

    /// Returns true if a client certificate pair is configured.
    #[must_use]
    pub fn has_client_cert(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }
}

/// Static hardware facts harvested once from a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFacts {
    /// Number of CPU cores.
    pub cpu_cores: u32,
    /// Total memory in megabytes.
    pub memory_mb: u64,
    /// Total swap in megabytes.
    pub swap_mb: u64,
    /// Root filesystem size in megabytes.
    pub disk_mb: u64,
    /// Machine architecture (`uname -m`).
    pub architecture: String,
    /// Uptime in seconds at harvest time.
    pub uptime_secs: u64,
}

/// Quota usage counters on a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUsage {
    /// CPU cores allocated to instances.
    pub used_cpu: u32,
    /// Memory allocated to instances in megabytes.
    pub used_memory_mb: u64,
    /// Disk allocated to instances in megabytes.
    pub used_disk_mb: u64,
    /// Number of containers.
    pub container_count: u32,
    /// Number of VMs.
    pub vm_count: u32,
}

/// A signed change to a provider's usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageDelta {
    /// CPU cores.
    pub cpu: i64,
    /// Memory in megabytes.
    pub memory_mb: i64,
    /// Disk in megabytes.
    pub disk_mb: i64,
    /// Containers.
    pub containers: i64,
    /// VMs.
    pub vms: i64,
}

impl UsageDelta {
    /// The usage an instance adds to its provider.
    #[must_use]
    pub fn for_instance(instance: &Instance) -> Self {
        let (containers, vms) = match instance.kind {
            InstanceKind::Container => (1, 0),
            InstanceKind::Vm => (0, 1),
        };
        Self {
            cpu: i64::from(instance.resources.cpu),
            memory_mb: i64::try_from(instance.resources.memory_mb).unwrap_or(i64::MAX),
            disk_mb: i64::try_from(instance.resources.disk_mb).unwrap_or(i64::MAX),
            containers,
            vms,
        }
    }

    /// The same delta with every component negated.
    #[must_use]
    pub const fn negate(self) -> Self {
        Self {
            cpu: -self.cpu,
            memory_mb: -self.memory_mb,
            disk_mb: -self.disk_mb,
            containers: -self.containers,
            vms: -self.vms,
        }
    }

    /// The delta that removing `instance` applies to its provider.
    ///
    /// Instances still creating or that failed to create were never counted.
    #[must_use]
    pub fn released_by(instance: &Instance) -> Self {
        if matches!(instance.status, InstanceStatus::Creating | InstanceStatus::Failed) {
            Self::default()
        } else {
            Self::for_instance(instance).negate()
        }
    }
}

fn saturating_apply_u32(value: u32, delta: i64) -> u32 {
    let next = i64::from(value).saturating_add(delta).max(0);
    u32::try_from(next).unwrap_or(u32::MAX)
}

fn saturating_apply_u64(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta.unsigned_abs())
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

impl ProviderUsage {
    /// Apply a delta, clamping every counter at zero.
    pub fn apply(&mut self, delta: UsageDelta) {
        self.used_cpu = saturating_apply_u32(self.used_cpu, delta.cpu);
        self.used_memory_mb = saturating_apply_u64(self.used_memory_mb, delta.memory_mb);
        self.used_disk_mb = saturating_apply_u64(self.used_disk_mb, delta.disk_mb);
        self.container_count = saturating_apply_u32(self.container_count, delta.containers);
        self.vm_count = saturating_apply_u32(self.vm_count, delta.vms);
    }
}

/// A provider (virtualization host) record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    /// Unique identifier.
    pub id: ProviderId,
    /// Human-readable name.
    pub name: String,
    /// Backend family.
    pub kind: ProviderKind,

    /// Hostname or IP, optionally with a `:port` suffix.
    pub host: String,
    /// SSH port.
    pub ssh_port: u16,
    /// SSH user.
    pub username: String,
    /// Secrets.
    #[serde(default)]
    pub credentials: Credentials,
    /// API port override.
    #[serde(default)]
    pub api_port: Option<u16>,
    /// Skip TLS verification for API calls.
    #[serde(default = "default_true")]
    pub api_skip_tls_verify: bool,
    /// Proxmox node name; discovered with `hostname` when absent.
    #[serde(default)]
    pub node_name: Option<String>,

    /// Containers may be created here.
    pub container_enabled: bool,
    /// VMs may be created here.
    pub vm_enabled: bool,
    /// How the backend may be driven.
    #[serde(default)]
    pub execution_rule: ExecutionRule,
    /// Network topology.
    #[serde(default)]
    pub network_type: NetworkType,

    /// Concurrent task limit when `allow_concurrent_tasks` is set.
    pub max_concurrent_tasks: u32,
    /// Allow more than one task at a time.
    pub allow_concurrent_tasks: bool,

    /// First port of the host range handed out to instances.
    pub port_range_start: u16,
    /// Last port of the host range (inclusive).
    pub port_range_end: u16,
    /// Allocation cursor.
    pub next_available_port: u16,
    /// Number of default mappings created with each NAT instance.
    pub default_port_count: u16,
    /// Public IP advertised for mapped ports.
    #[serde(default)]
    pub port_ip: Option<String>,

    /// Last SSH check result.
    #[serde(default)]
    pub ssh_status: CheckStatus,
    /// Last API check result.
    #[serde(default)]
    pub api_status: CheckStatus,
    /// Aggregated status.
    #[serde(default)]
    pub status: ProviderStatus,
    /// When the last health check completed.
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    /// Last time the provider was seen fully healthy.
    #[serde(default)]
    pub last_active_at: Option<DateTime<Utc>>,
    /// Systemd units for the service check; `None` uses the kind defaults.
    #[serde(default)]
    pub health_services: Option<Vec<String>>,
    /// Static facts have been harvested.
    #[serde(default)]
    pub resource_synced: bool,
    /// Harvested static facts.
    #[serde(default)]
    pub resources: Option<ResourceFacts>,

    /// Administratively frozen.
    pub is_frozen: bool,
    /// Provider lease end.
    pub expires_at: Option<DateTime<Utc>>,
    /// New instances may be placed here.
    pub allow_claim: bool,
    /// Quota usage.
    #[serde(default)]
    pub usage: ProviderUsage,

    /// SSH connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub ssh_connect_timeout_secs: u64,
    /// SSH command timeout in seconds.
    #[serde(default = "default_execute_timeout")]
    pub ssh_execute_timeout_secs: u64,

    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

const fn default_true() -> bool {
    true
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_execute_timeout() -> u64 {
    300
}

impl Provider {
    /// Create a provider with default settings.
    #[must_use]
    pub fn new(id: ProviderId, name: impl Into<String>, kind: ProviderKind, host: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            kind,
            host: host.into(),
            ssh_port: 22,
            username: "root".to_string(),
            credentials: Credentials::default(),
            api_port: None,
            api_skip_tls_verify: true,
            node_name: None,
            container_enabled: true,
            vm_enabled: false,
            execution_rule: ExecutionRule::Auto,
            network_type: NetworkType::NatIpv4,
            max_concurrent_tasks: 1,
            allow_concurrent_tasks: false,
            port_range_start: 10000,
            port_range_end: 65535,
            next_available_port: 10000,
            default_port_count: 10,
            port_ip: None,
            ssh_status: CheckStatus::Unknown,
            api_status: CheckStatus::Unknown,
            status: ProviderStatus::Unknown,
            last_health_check: None,
            last_active_at: None,
            health_services: None,
            resource_synced: false,
            resources: None,
            is_frozen: false,
            expires_at: None,
            allow_claim: true,
            usage: ProviderUsage::default(),
            ssh_connect_timeout_secs: default_connect_timeout(),
            ssh_execute_timeout_secs: default_execute_timeout(),
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the provider lease has ended.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Returns true if the provider may accept new tasks.
    ///
    /// Frozen, expired, and soft-deleted providers accept nothing.
    #[must_use]
    pub fn accepts_tasks(&self, now: DateTime<Utc>) -> bool {
        !self.is_frozen && self.deleted_at.is_none() && !self.is_expired(now)
    }

    /// Host without any `:port` suffix.
    #[must_use]
    pub fn endpoint_host(&self) -> &str {
        strip_port(&self.host)
    }

    /// The IP advertised for mapped ports: `port_ip` when set, otherwise the
    /// endpoint host.
    #[must_use]
    pub fn public_ip(&self) -> &str {
        self.port_ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .map_or_else(|| self.endpoint_host(), strip_port)
    }

    /// Effective API port.
    #[must_use]
    pub fn effective_api_port(&self) -> Option<u16> {
        self.api_port.or_else(|| self.kind.default_api_port())
    }

    /// Effective systemd units for the service check.
    #[must_use]
    pub fn effective_services(&self) -> Vec<String> {
        self.health_services
            .clone()
            .unwrap_or_else(|| self.kind.default_services())
    }

    /// Maximum number of simultaneously running tasks.
    #[must_use]
    pub fn task_slot_limit(&self) -> usize {
        if self.allow_concurrent_tasks {
            usize::try_from(self.max_concurrent_tasks.max(1)).unwrap_or(usize::MAX)
        } else {
            1
        }
    }

    /// Returns true if `port` lies inside the configured host range.
    #[must_use]
    pub const fn port_in_range(&self, port: u16) -> bool {
        port >= self.port_range_start && port <= self.port_range_end
    }

    /// Number of ports in the configured range.
    #[must_use]
    pub fn port_range_len(&self) -> u32 {
        if self.port_range_end < self.port_range_start {
            0
        } else {
            u32::from(self.port_range_end - self.port_range_start) + 1
        }
    }
}

/// Strip an optional `:port` suffix, leaving bracketed IPv6 literals intact.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.parse::<u16>().is_ok() => name,
        _ => host,
    }
}

// =============================================================================
// Instances
// =============================================================================

/// Kind of workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    /// System or application container.
    Container,
    /// Virtual machine.
    Vm,
}

impl InstanceKind {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Vm => "vm",
        }
    }
}

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum InstanceStatus {
    /// Being created.
    Creating = 1,
    /// Running.
    Running = 2,
    /// Stopped.
    Stopped = 3,
    /// Start in progress.
    Starting = 4,
    /// Stop in progress.
    Stopping = 5,
    /// Restart in progress.
    Restarting = 6,
    /// Password reset in progress.
    Resetting = 7,
    /// Deletion in progress.
    Deleting = 8,
    /// Last operation failed.
    Failed = 9,
}

impl InstanceStatus {
    /// Returns true while an operation is acting on the instance.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        matches!(
            self,
            Self::Creating
                | Self::Starting
                | Self::Stopping
                | Self::Restarting
                | Self::Resetting
                | Self::Deleting
        )
    }
}

/// Resources requested for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// CPU cores.
    pub cpu: u32,
    /// Memory in megabytes.
    pub memory_mb: u64,
    /// Disk in megabytes.
    pub disk_mb: u64,
    /// Bandwidth cap in Mbit/s.
    pub bandwidth_mbps: u32,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpu: 1,
            memory_mb: 512,
            disk_mb: 10 * 1024,
            bandwidth_mbps: 100,
        }
    }
}

/// An instance (container or VM) record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Unique identifier.
    pub id: InstanceId,
    /// Name on the backend.
    pub name: String,
    /// Hosting provider.
    pub provider_id: ProviderId,
    /// Container or VM.
    pub kind: InstanceKind,
    /// Requested resources.
    pub resources: ResourceSpec,
    /// Image name or template reference.
    pub image: String,
    /// Archive URL to download the image from, if not pulled by name.
    #[serde(default)]
    pub image_url: Option<String>,
    /// Target architecture.
    #[serde(default = "default_architecture")]
    pub architecture: String,
    /// Current status.
    pub status: InstanceStatus,
    /// Host port forwarded to guest port 22.
    pub ssh_port: Option<u16>,
    /// Address inside the provider network.
    pub private_ip: Option<String>,
    /// Publicly reachable address.
    pub public_ip: Option<String>,
    /// Lease end.
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

fn default_architecture() -> String {
    "amd64".to_string()
}

impl Instance {
    /// Create an instance record in the `Creating` state.
    #[must_use]
    pub fn new(
        id: InstanceId,
        provider_id: ProviderId,
        name: impl Into<String>,
        kind: InstanceKind,
        image: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            provider_id,
            kind,
            resources: ResourceSpec::default(),
            image: image.into(),
            image_url: None,
            architecture: default_architecture(),
            status: InstanceStatus::Creating,
            ssh_port: None,
            private_ip: None,
            public_ip: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the instance lease has ended.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// Operation a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum TaskType {
    /// Create an instance.
    Create = 1,
    /// Start an instance.
    Start = 2,
    /// Stop an instance.
    Stop = 3,
    /// Restart an instance.
    Restart = 4,
    /// Delete an instance.
    Delete = 5,
    /// Reset the instance root password.
    ResetPassword = 6,
    /// Add a port mapping.
    CreatePortMapping = 7,
    /// Remove a port mapping.
    DeletePortMapping = 8,
}

impl TaskType {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Delete => "delete",
            Self::ResetPassword => "reset-password",
            Self::CreatePortMapping => "create-port-mapping",
            Self::DeletePortMapping => "delete-port-mapping",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            "delete" => Some(Self::Delete),
            "reset-password" | "reset_password" => Some(Self::ResetPassword),
            "create-port-mapping" => Some(Self::CreatePortMapping),
            "delete-port-mapping" => Some(Self::DeletePortMapping),
            _ => None,
        }
    }

    /// Allotted run time when the caller does not specify one.
    #[must_use]
    pub const fn default_timeout_secs(self) -> u64 {
        match self {
            Self::Create => 1800,
            Self::Start | Self::Stop | Self::DeletePortMapping => 300,
            Self::Restart | Self::Delete | Self::ResetPassword | Self::CreatePortMapping => 600,
        }
    }
}

/// Task lifecycle status.
///
/// ```text
/// pending → running → {completed, failed}
/// pending | running → cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TaskStatus {
    /// Waiting for a provider slot.
    Pending = 1,
    /// Executing.
    Running = 2,
    /// Finished successfully.
    Completed = 3,
    /// Finished with an error or timed out.
    Failed = 4,
    /// Cancelled before completion.
    Cancelled = 5,
}

impl TaskStatus {
    /// Convert the status to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value to a `TaskStatus`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Pending),
            2 => Some(Self::Running),
            3 => Some(Self::Completed),
            4 => Some(Self::Failed),
            5 => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Returns true for completed, failed, and cancelled.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true for pending and running.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// An asynchronous operation against one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,
    /// Operation.
    pub task_type: TaskType,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Completion percentage, 0 to 100.
    pub progress: u8,
    /// Provider the task runs against.
    pub provider_id: ProviderId,
    /// Target instance, if any.
    pub instance_id: Option<InstanceId>,
    /// Executor-specific input.
    pub payload: serde_json::Value,
    /// Allotted run time in seconds.
    pub timeout_secs: u64,
    /// Orchestrator process that ran the task.
    pub executor_id: Option<String>,
    /// Whether the owning user may cancel the task.
    pub force_stoppable: bool,
    /// Executor-specific output.
    pub result_data: Option<serde_json::Value>,
    /// Failure description.
    pub error_message: Option<String>,
    /// Latest human-readable progress note.
    pub status_message: Option<String>,
    /// Accumulated progress notes.
    #[serde(default)]
    pub log_output: String,
    /// Why the task was cancelled.
    #[serde(default)]
    pub cancel_reason: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task completed or failed.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the task was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task.
    #[must_use]
    pub fn new(
        provider_id: ProviderId,
        instance_id: Option<InstanceId>,
        task_type: TaskType,
        payload: serde_json::Value,
        timeout_secs: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            task_type,
            status: TaskStatus::Pending,
            progress: 0,
            provider_id,
            instance_id,
            payload,
            timeout_secs,
            executor_id: None,
            force_stoppable: true,
            result_data: None,
            error_message: None,
            status_message: None,
            log_output: String::new(),
            cancel_reason: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            updated_at: now,
        }
    }

    /// When a running task exceeds its allotted time.
    #[must_use]
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.timeout_secs).ok()?;
        let allotted = Duration::try_seconds(secs)?;
        self.started_at
            .and_then(|at| at.checked_add_signed(allotted))
    }

    /// Returns true if the task is running past its deadline.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running && self.deadline().is_some_and(|d| d < now)
    }

    /// When the task reached a terminal state.
    #[must_use]
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.cancelled_at)
    }
}

// =============================================================================
// Port Mappings
// =============================================================================

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Protocol {
    /// TCP only.
    #[default]
    Tcp = 1,
    /// UDP only.
    Udp = 2,
    /// Both TCP and UDP.
    Both = 3,
}

impl Protocol {
    /// Convert the protocol to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Both => "both",
        }
    }

    /// Parse a protocol name. An empty string means TCP.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            "both" | "tcp+udp" | "tcp/udp" => Some(Self::Both),
            _ => None,
        }
    }

    /// The concrete transport protocols this value occupies.
    #[must_use]
    pub const fn expand(self) -> &'static [Protocol] {
        match self {
            Self::Tcp => &[Self::Tcp],
            Self::Udp => &[Self::Udp],
            Self::Both => &[Self::Tcp, Self::Udp],
        }
    }
}

/// Status of a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PortMappingStatus {
    /// Reserved in storage, not yet configured on the backend.
    #[default]
    Pending,
    /// Configured on the backend.
    Active,
    /// Backend configuration failed.
    Failed,
}

/// A host port forwarded to an instance port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Unique identifier.
    pub id: PortMappingId,
    /// Target instance.
    pub instance_id: InstanceId,
    /// Provider owning the host port.
    pub provider_id: ProviderId,
    /// Port on the provider.
    pub host_port: u16,
    /// Port inside the instance.
    pub guest_port: u16,
    /// Protocol.
    pub protocol: Protocol,
    /// This mapping carries SSH.
    pub is_ssh: bool,
    /// Created automatically with the instance.
    pub is_automatic: bool,
    /// Backend mechanism that realizes the mapping.
    pub mapping_method: String,
    /// Status.
    pub status: PortMappingStatus,
    /// Free-form description.
    pub description: String,
    /// Also listen on IPv6.
    #[serde(default)]
    pub ipv6_enabled: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// How the host port of a new mapping is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPortRequest {
    /// Exactly this port; fails if taken.
    Exact(u16),
    /// This port if free and inside the range, otherwise the next free one.
    PreferOrNext(u16),
    /// This port if free; the mapping is skipped otherwise.
    IfFree(u16),
    /// The next free port from the provider's allocation cursor.
    Next,
}

/// A port mapping to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPortMapping {
    /// Target instance.
    pub instance_id: InstanceId,
    /// Host port selection.
    pub host_port: HostPortRequest,
    /// Port inside the instance.
    pub guest_port: u16,
    /// Protocol.
    pub protocol: Protocol,
    /// This mapping carries SSH.
    pub is_ssh: bool,
    /// Created automatically with the instance.
    pub is_automatic: bool,
    /// Backend mechanism that realizes the mapping.
    pub mapping_method: String,
    /// Free-form description.
    pub description: String,
    /// Also listen on IPv6.
    pub ipv6_enabled: bool,
}

impl NewPortMapping {
    /// A TCP mapping with the given host port selection.
    #[must_use]
    pub fn new(instance_id: InstanceId, host_port: HostPortRequest, guest_port: u16) -> Self {
        Self {
            instance_id,
            host_port,
            guest_port,
            protocol: Protocol::Tcp,
            is_ssh: false,
            is_automatic: false,
            mapping_method: String::new(),
            description: String::new(),
            ipv6_enabled: false,
        }
    }

    /// Set the protocol.
    #[must_use]
    pub const fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_admission_rules() {
        let now = Utc::now();
        let mut provider = Provider::new(ProviderId::new(1), "p", ProviderKind::Docker, "10.0.0.1");
        assert!(provider.accepts_tasks(now));

        provider.is_frozen = true;
        assert!(!provider.accepts_tasks(now));

        provider.is_frozen = false;
        provider.expires_at = Some(now - Duration::minutes(1));
        assert!(!provider.accepts_tasks(now));

        provider.expires_at = None;
        provider.deleted_at = Some(now);
        assert!(!provider.accepts_tasks(now));
    }

    #[test]
    fn public_ip_prefers_port_ip_and_strips_port() {
        let mut provider =
            Provider::new(ProviderId::new(1), "p", ProviderKind::Lxd, "203.0.113.7:8443");
        assert_eq!(provider.public_ip(), "203.0.113.7");

        provider.port_ip = Some("198.51.100.2".to_string());
        assert_eq!(provider.public_ip(), "198.51.100.2");

        provider.port_ip = Some(String::new());
        assert_eq!(provider.public_ip(), "203.0.113.7");
    }

    #[test]
    fn bare_ipv6_host_is_not_truncated() {
        let provider = Provider::new(ProviderId::new(1), "p", ProviderKind::Lxd, "2001:db8::1");
        assert_eq!(provider.endpoint_host(), "2001:db8::1");
        let bracketed =
            Provider::new(ProviderId::new(1), "p", ProviderKind::Lxd, "[2001:db8::1]:22");
        assert_eq!(bracketed.endpoint_host(), "2001:db8::1");
    }

    #[test]
    fn slot_limit_respects_concurrency_flag() {
        let mut provider = Provider::new(ProviderId::new(1), "p", ProviderKind::Docker, "h");
        provider.max_concurrent_tasks = 4;
        assert_eq!(provider.task_slot_limit(), 1);
        provider.allow_concurrent_tasks = true;
        assert_eq!(provider.task_slot_limit(), 4);
        provider.max_concurrent_tasks = 0;
        assert_eq!(provider.task_slot_limit(), 1);
    }

    #[test]
    fn usage_never_goes_negative() {
        let mut usage = ProviderUsage::default();
        let instance = Instance::new(
            InstanceId::new(1),
            ProviderId::new(1),
            "c1",
            InstanceKind::Container,
            "debian",
        );
        let delta = UsageDelta::for_instance(&instance);
        usage.apply(delta);
        assert_eq!(usage.container_count, 1);
        assert_eq!(usage.used_memory_mb, 512);

        usage.apply(delta.negate());
        usage.apply(delta.negate());
        assert_eq!(usage, ProviderUsage::default());
    }

    #[test]
    fn uncounted_instances_release_nothing() {
        let mut instance = Instance::new(
            InstanceId::new(1),
            ProviderId::new(1),
            "c1",
            InstanceKind::Container,
            "debian",
        );
        assert_eq!(UsageDelta::released_by(&instance), UsageDelta::default());
        instance.status = InstanceStatus::Stopped;
        assert_eq!(UsageDelta::released_by(&instance).containers, -1);
    }

    #[test]
    fn task_default_timeouts() {
        assert_eq!(TaskType::Create.default_timeout_secs(), 1800);
        assert_eq!(TaskType::Start.default_timeout_secs(), 300);
        assert_eq!(TaskType::Restart.default_timeout_secs(), 600);
        assert_eq!(TaskType::DeletePortMapping.default_timeout_secs(), 300);
    }

    #[test]
    fn overdue_only_when_running_past_deadline() {
        let mut task = Task::new(
            ProviderId::new(1),
            None,
            TaskType::Start,
            serde_json::Value::Null,
            60,
        );
        let now = Utc::now();
        assert!(!task.is_overdue(now));

        task.status = TaskStatus::Running;
        task.started_at = Some(now - Duration::seconds(61));
        assert!(task.is_overdue(now));

        task.started_at = Some(now - Duration::seconds(30));
        assert!(!task.is_overdue(now));
    }

    #[test]
    fn protocol_parsing_and_expansion() {
        assert_eq!(Protocol::parse(""), Some(Protocol::Tcp));
        assert_eq!(Protocol::parse("UDP"), Some(Protocol::Udp));
        assert_eq!(Protocol::parse("sctp"), None);
        assert_eq!(Protocol::Both.expand(), &[Protocol::Tcp, Protocol::Udp]);
    }

    #[test]
    fn task_type_wire_names() {
        for ty in [
            TaskType::Create,
            TaskType::ResetPassword,
            TaskType::CreatePortMapping,
        ] {
            assert_eq!(TaskType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(
            serde_json::to_string(&TaskType::ResetPassword).unwrap(),
            "\"reset-password\""
        );
    }
}
