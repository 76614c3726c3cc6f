//! Proxmox VE backend.
//!
//! Guests are addressed by name; the vmid and guest type (`qemu` or `lxc`)
//! are looked up on each operation. With an API token configured the REST
//! API is used and its task UPIDs are polled to completion; otherwise `qm`,
//! `pct`, `pvesh` and `pveam` run over SSH.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use virtfleet_core::ProviderId;
use virtfleet_store::{ExecutionRule, InstanceKind, Provider, ProviderKind};

use super::image::{CdnConfig, ImageFetcher};
use super::{chpasswd_script, is_missing};
use crate::api::ApiClient;
use crate::capability::{
    Connection, HealthCheck, ImageInfo, ImageManagement, InstanceInfo, InstanceSpec, Lifecycle,
    ProgressFn, ProviderBackend,
};
use crate::error::{ProviderError, Result};
use crate::health::{HealthChecker, HealthResult};
use crate::registry::{BackendOptions, ProviderRegistry};
use crate::retry::RetryPolicy;
use crate::transport::{shell_quote, RemoteSession};

/// Storage holding guest disks.
const DISK_STORAGE: &str = "local-lvm";

/// Storage holding templates and ISOs.
const TEMPLATE_STORAGE: &str = "local";

/// Directory backing `local:vztmpl/`.
const TEMPLATE_DIR: &str = "/var/lib/vz/template/cache";

/// Interval between task status polls.
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Register the Proxmox constructor.
pub fn register(registry: &mut ProviderRegistry) {
    registry.register(
        ProviderKind::Proxmox,
        Arc::new(|provider, options| {
            Ok(Arc::new(ProxmoxBackend::new(provider, options)?) as Arc<dyn ProviderBackend>)
        }),
    );
}

/// Guest type on a Proxmox node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuestType {
    Qemu,
    Lxc,
}

impl GuestType {
    const fn for_kind(kind: InstanceKind) -> Self {
        match kind {
            InstanceKind::Vm => Self::Qemu,
            InstanceKind::Container => Self::Lxc,
        }
    }

    const fn api_segment(self) -> &'static str {
        match self {
            Self::Qemu => "qemu",
            Self::Lxc => "lxc",
        }
    }

    const fn cli(self) -> &'static str {
        match self {
            Self::Qemu => "qm",
            Self::Lxc => "pct",
        }
    }

    const fn kind(self) -> InstanceKind {
        match self {
            Self::Qemu => InstanceKind::Vm,
            Self::Lxc => InstanceKind::Container,
        }
    }
}

/// A guest located on the node.
#[derive(Debug, Clone, Copy)]
struct Guest {
    vmid: u32,
    guest_type: GuestType,
}

/// Proxmox VE node.
pub struct ProxmoxBackend {
    provider_id: ProviderId,
    session: RemoteSession,
    api: Option<ApiClient>,
    api_only: bool,
    api_connected: AtomicBool,
    node: Mutex<Option<String>>,
    health: HealthChecker,
    retry: RetryPolicy,
    cdn: CdnConfig,
    container_enabled: bool,
    vm_enabled: bool,
}

impl ProxmoxBackend {
    /// Create a backend for `provider`.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::InvalidConfig` for `api_only` providers
    /// without an API token.
    pub fn new(provider: &Provider, options: &BackendOptions) -> Result<Self> {
        let api = ApiClient::for_provider(provider)?;
        Self::with_parts(provider, RemoteSession::for_provider(provider), api, options)
    }

    /// Create a backend from an existing session and optional API client.
    ///
    /// # Errors
    ///
    /// Same as [`ProxmoxBackend::new`].
    pub fn with_parts(
        provider: &Provider,
        session: RemoteSession,
        api: Option<ApiClient>,
        options: &BackendOptions,
    ) -> Result<Self> {
        let api_only = provider.execution_rule == ExecutionRule::ApiOnly;
        if api_only && api.is_none() {
            return Err(ProviderError::InvalidConfig(
                "api_only requires an API token id and secret".to_string(),
            ));
        }
        let health = HealthChecker::for_provider(provider, session.shell())?;
        Ok(Self {
            provider_id: provider.id,
            session,
            api,
            api_only,
            api_connected: AtomicBool::new(false),
            node: Mutex::new(provider.node_name.clone()),
            health,
            retry: RetryPolicy::for_provider(provider, options.retry_attempts),
            cdn: CdnConfig {
                download_dir: TEMPLATE_DIR.to_string(),
                ..options.cdn.clone()
            },
            container_enabled: provider.container_enabled,
            vm_enabled: provider.vm_enabled,
        })
    }

    /// Node name, resolved once from the API or `hostname`.
    async fn node(&self) -> Result<String> {
        if let Some(node) = self.node.lock().clone() {
            return Ok(node);
        }
        let resolved = if let Some(api) = &self.api {
            let body = api.get("/api2/json/nodes").await?;
            body["data"]
                .as_array()
                .and_then(|nodes| nodes.first())
                .and_then(|n| n["node"].as_str())
                .map(ToString::to_string)
                .ok_or_else(|| ProviderError::Parse("node list is empty".to_string()))?
        } else {
            self.session.exec("hostname").await?.trim().to_string()
        };
        debug!(provider_id = %self.provider_id, node = %resolved, "Resolved Proxmox node");
        *self.node.lock() = Some(resolved.clone());
        Ok(resolved)
    }

    async fn guests(&self) -> Result<Vec<(Guest, InstanceInfo)>> {
        let mut guests = Vec::new();
        if let Some(api) = &self.api {
            let node = self.node().await?;
            for guest_type in [GuestType::Qemu, GuestType::Lxc] {
                let body = api
                    .get(&format!("/api2/json/nodes/{node}/{}", guest_type.api_segment()))
                    .await?;
                if let Some(items) = body["data"].as_array() {
                    guests.extend(items.iter().filter_map(|item| parse_api_guest(item, guest_type)));
                }
            }
        } else {
            let qm = self.session.exec("qm list").await?;
            guests.extend(parse_qm_list(&qm));
            let pct = self.session.exec("pct list").await?;
            guests.extend(parse_pct_list(&pct));
        }
        Ok(guests)
    }

    async fn locate(&self, name: &str) -> Result<Guest> {
        self.guests()
            .await?
            .into_iter()
            .find(|(_, info)| info.name == name)
            .map(|(guest, _)| guest)
            .ok_or_else(|| ProviderError::NotFound(format!("guest {name}")))
    }

    /// Poll a task UPID until it stops.
    async fn wait_task(&self, api: &ApiClient, node: &str, upid: &Value) -> Result<()> {
        let Some(upid) = upid.as_str().filter(|u| !u.is_empty()) else {
            return Ok(());
        };
        let started = Instant::now();
        loop {
            let body = api
                .get(&format!("/api2/json/nodes/{node}/tasks/{upid}/status"))
                .await?;
            let data = &body["data"];
            if data["status"] == "stopped" {
                return match data["exitstatus"].as_str() {
                    Some("OK") | None => Ok(()),
                    Some(exit) => Err(ProviderError::command(upid, None, exit)),
                };
            }
            if started.elapsed() >= self.retry.attempt_timeout {
                return Err(ProviderError::Timeout {
                    operation: format!("proxmox task {upid}"),
                    secs: self.retry.attempt_timeout.as_secs(),
                });
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    async fn api_task(&self, api: &ApiClient, method: Method, path: &str, body: Option<&Value>) -> Result<()> {
        let node = self.node().await?;
        let response = api
            .request(method, &format!("/api2/json/nodes/{node}{path}"), body)
            .await?;
        self.wait_task(api, &node, &response["data"]).await
    }

    async fn guest_action(&self, guest: Guest, action: &str) -> Result<()> {
        if let Some(api) = &self.api {
            let path = format!("/{}/{}/status/{action}", guest.guest_type.api_segment(), guest.vmid);
            return self.api_task(api, Method::POST, &path, None).await;
        }
        self.session
            .exec(&format!("{} {action} {}", guest.guest_type.cli(), guest.vmid))
            .await
            .map(|_| ())
    }

    async fn next_vmid(&self) -> Result<u32> {
        let raw = if let Some(api) = &self.api {
            let body = api.get("/api2/json/cluster/nextid").await?;
            match &body["data"] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }
        } else {
            self.session.exec("pvesh get /cluster/nextid").await?
        };
        raw.trim()
            .trim_matches('"')
            .parse()
            .map_err(|_| ProviderError::Parse(format!("invalid next vmid: {}", raw.trim())))
    }

    /// Resolve the template or ISO volume for a create.
    async fn prepare_template(&self, spec: &InstanceSpec, progress: &ProgressFn) -> Result<String> {
        if spec.image.contains(':') {
            progress(50, "Template available");
            return Ok(spec.image.clone());
        }
        if spec.kind == InstanceKind::Vm {
            progress(50, "ISO selected");
            return Ok(format!("{TEMPLATE_STORAGE}:iso/{}", spec.image));
        }
        if self.api_only {
            progress(50, "Template selected");
            return Ok(format!("{TEMPLATE_STORAGE}:vztmpl/{}", spec.image));
        }

        progress(30, "Downloading template");
        let file = if let Some(url) = spec.image_url.as_deref() {
            let fetcher = ImageFetcher::new(&self.session, &self.cdn);
            let path = fetcher.download(&spec.image, url, &spec.architecture).await?;
            path.rsplit('/').next().unwrap_or(&path).to_string()
        } else {
            let template = shell_quote(&spec.image);
            self.session
                .exec(&format!(
                    "pveam list {TEMPLATE_STORAGE} | grep -q {template} || (pveam update && pveam download {TEMPLATE_STORAGE} {template})"
                ))
                .await?;
            spec.image.clone()
        };
        progress(50, "Template ready");
        Ok(format!("{TEMPLATE_STORAGE}:vztmpl/{file}"))
    }

    async fn create_guest(&self, vmid: u32, spec: &InstanceSpec, volume: &str) -> Result<()> {
        let disk_gb = spec.disk_mb.div_ceil(1024).max(1);
        let guest_type = GuestType::for_kind(spec.kind);

        if let Some(api) = &self.api {
            let body = match guest_type {
                GuestType::Lxc => json!({
                    "vmid": vmid,
                    "ostemplate": volume,
                    "hostname": spec.name,
                    "cores": spec.cpu,
                    "memory": spec.memory_mb,
                    "swap": 0,
                    "rootfs": format!("{DISK_STORAGE}:{disk_gb}"),
                    "net0": "name=eth0,bridge=vmbr0,ip=dhcp",
                    "unprivileged": 1,
                }),
                GuestType::Qemu => json!({
                    "vmid": vmid,
                    "name": spec.name,
                    "cores": spec.cpu,
                    "memory": spec.memory_mb,
                    "net0": "virtio,bridge=vmbr0",
                    "scsihw": "virtio-scsi-pci",
                    "scsi0": format!("{DISK_STORAGE}:{disk_gb}"),
                    "ide2": format!("{volume},media=cdrom"),
                    "boot": "order=scsi0;ide2",
                    "agent": "enabled=1",
                }),
            };
            return self
                .api_task(api, Method::POST, &format!("/{}", guest_type.api_segment()), Some(&body))
                .await;
        }

        let command = match guest_type {
            GuestType::Lxc => format!(
                "pct create {vmid} {} --hostname {} --cores {} --memory {} --swap 0 --rootfs {DISK_STORAGE}:{disk_gb} --net0 name=eth0,bridge=vmbr0,ip=dhcp --unprivileged 1",
                shell_quote(volume),
                shell_quote(&spec.name),
                spec.cpu,
                spec.memory_mb,
            ),
            GuestType::Qemu => format!(
                "qm create {vmid} --name {} --cores {} --memory {} --net0 virtio,bridge=vmbr0 --scsihw virtio-scsi-pci --scsi0 {DISK_STORAGE}:{disk_gb} --ide2 {},media=cdrom --boot 'order=scsi0;ide2' --agent enabled=1",
                shell_quote(&spec.name),
                spec.cpu,
                spec.memory_mb,
                volume,
            ),
        };
        self.session.exec(&command).await.map(|_| ())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        let guest = match self.locate(name).await {
            Ok(guest) => guest,
            Err(ProviderError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match self.guest_action(guest, "stop").await {
            Err(e) if e.is_connectivity() => return Err(e),
            Err(e) => debug!(instance = %name, error = %e, "Stop before destroy failed"),
            Ok(()) => {}
        }
        let result = if let Some(api) = &self.api {
            let path = format!("/{}/{}?purge=1", guest.guest_type.api_segment(), guest.vmid);
            self.api_task(api, Method::DELETE, &path, None).await
        } else {
            self.session
                .exec(&format!("{} destroy {} --purge", guest.guest_type.cli(), guest.vmid))
                .await
                .map(|_| ())
        };
        match result {
            Err(e) if !e.is_connectivity() && is_missing(&e.to_string()) => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl Connection for ProxmoxBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Proxmox
    }

    async fn connect(&self) -> Result<()> {
        if self.api_only {
            if let Some(api) = &self.api {
                api.get("/api2/json/version").await?;
                self.api_connected.store(true, Ordering::SeqCst);
            }
        } else {
            self.session.connect().await?;
        }
        info!(provider_id = %self.provider_id, "Connected to Proxmox node");
        Ok(())
    }

    async fn disconnect(&self) {
        self.session.disconnect();
        self.api_connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        if self.api_only {
            self.api_connected.load(Ordering::SeqCst)
        } else {
            self.session.is_connected()
        }
    }

    async fn ensure_connection(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.connect().await
    }

    async fn execute_ssh_command(&self, command: &str) -> Result<String> {
        if self.api_only {
            return Err(ProviderError::unsupported(ProviderKind::Proxmox, "ssh commands on api_only providers"));
        }
        self.session.exec(command).await
    }
}

#[async_trait]
impl Lifecycle for ProxmoxBackend {
    fn supported_instance_types(&self) -> Vec<InstanceKind> {
        let mut kinds = Vec::new();
        if self.container_enabled {
            kinds.push(InstanceKind::Container);
        }
        if self.vm_enabled {
            kinds.push(InstanceKind::Vm);
        }
        kinds
    }

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
        Ok(self.guests().await?.into_iter().map(|(_, info)| info).collect())
    }

    async fn get_instance(&self, name: &str) -> Result<InstanceInfo> {
        self.guests()
            .await?
            .into_iter()
            .map(|(_, info)| info)
            .find(|info| info.name == name)
            .ok_or_else(|| ProviderError::NotFound(format!("guest {name}")))
    }

    async fn create_instance_with_progress(&self, spec: &InstanceSpec, progress: ProgressFn) -> Result<InstanceInfo> {
        if !self.supported_instance_types().contains(&spec.kind) {
            return Err(ProviderError::unsupported(ProviderKind::Proxmox, "instance kind disabled on this provider"));
        }

        progress(10, "Preparing template");
        let volume = self.prepare_template(spec, &progress).await?;

        progress(70, "Creating guest");
        let vmid = self.next_vmid().await?;
        let guest = Guest {
            vmid,
            guest_type: GuestType::for_kind(spec.kind),
        };
        let result = match self.create_guest(vmid, spec, &volume).await {
            Ok(()) => {
                progress(90, "Starting guest");
                match self.guest_action(guest, "start").await {
                    Ok(()) => self.get_instance(&spec.name).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(info) => {
                progress(100, "Guest ready");
                info!(provider_id = %self.provider_id, instance = %spec.name, vmid, "Guest created");
                Ok(info)
            }
            Err(e) => {
                warn!(provider_id = %self.provider_id, instance = %spec.name, vmid, error = %e, "Guest creation failed, cleaning up");
                if let Err(cleanup) = self.destroy(&spec.name).await {
                    warn!(instance = %spec.name, error = %cleanup, "Failed to remove partial guest");
                }
                Err(e)
            }
        }
    }

    async fn start_instance(&self, name: &str) -> Result<()> {
        let guest = self.locate(name).await?;
        self.guest_action(guest, "start").await
    }

    async fn stop_instance(&self, name: &str) -> Result<()> {
        let guest = self.locate(name).await?;
        self.guest_action(guest, "stop").await
    }

    async fn restart_instance(&self, name: &str) -> Result<()> {
        let guest = self.locate(name).await?;
        self.guest_action(guest, "reboot").await
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        self.retry.run("delete_instance", self, || self.destroy(name)).await?;
        info!(provider_id = %self.provider_id, instance = %name, "Guest deleted");
        Ok(())
    }

    async fn set_instance_password(&self, name: &str, password: &str) -> Result<()> {
        let guest = self.locate(name).await?;
        match (guest.guest_type, &self.api) {
            (GuestType::Qemu, Some(api)) => {
                let node = self.node().await?;
                api.request(
                    Method::PUT,
                    &format!("/api2/json/nodes/{node}/qemu/{}/config", guest.vmid),
                    Some(&json!({"cipassword": password})),
                )
                .await?;
                Ok(())
            }
            (GuestType::Qemu, None) => self
                .session
                .exec(&format!("qm set {} --cipassword {}", guest.vmid, shell_quote(password)))
                .await
                .map(|_| ()),
            (GuestType::Lxc, _) if self.api_only => Err(ProviderError::unsupported(
                ProviderKind::Proxmox,
                "container password reset without SSH",
            )),
            (GuestType::Lxc, _) => self
                .session
                .exec(&format!("pct exec {} -- {}", guest.vmid, chpasswd_script(password)))
                .await
                .map(|_| ()),
        }
    }
}

#[async_trait]
impl ImageManagement for ProxmoxBackend {
    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        if let Some(api) = &self.api {
            let node = self.node().await?;
            let body = api
                .get(&format!("/api2/json/nodes/{node}/storage/{TEMPLATE_STORAGE}/content?content=vztmpl"))
                .await?;
            return Ok(body["data"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| {
                            let volid = item["volid"].as_str()?;
                            Some(ImageInfo {
                                id: volid.to_string(),
                                name: volid.rsplit('/').next().unwrap_or(volid).to_string(),
                                tag: None,
                                size: item["size"].as_u64().map(|b| b.to_string()).unwrap_or_default(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default());
        }
        let output = self.session.exec(&format!("pveam list {TEMPLATE_STORAGE}")).await?;
        Ok(parse_pveam_list(&output))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if let Some(api) = &self.api {
            let body = json!({"storage": TEMPLATE_STORAGE, "template": image});
            return self.api_task(api, Method::POST, "/aplinfo", Some(&body)).await;
        }
        self.session
            .exec(&format!("pveam download {TEMPLATE_STORAGE} {}", shell_quote(image)))
            .await
            .map(|_| ())
    }

    async fn delete_image(&self, image: &str) -> Result<()> {
        let volid = if image.contains(':') {
            image.to_string()
        } else {
            format!("{TEMPLATE_STORAGE}:vztmpl/{image}")
        };
        if let Some(api) = &self.api {
            let path = format!("/storage/{TEMPLATE_STORAGE}/content/{volid}");
            return self.api_task(api, Method::DELETE, &path, None).await;
        }
        self.session
            .exec(&format!("pveam remove {}", shell_quote(&volid)))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl HealthCheck for ProxmoxBackend {
    async fn health_check(&self, collect_resources: bool) -> Result<HealthResult> {
        Ok(self.health.check_health(collect_resources).await)
    }
}

fn parse_api_guest(item: &Value, guest_type: GuestType) -> Option<(Guest, InstanceInfo)> {
    let vmid = match &item["vmid"] {
        Value::Number(n) => u32::try_from(n.as_u64()?).ok()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    let name = item["name"].as_str().unwrap_or_default().to_string();
    Some((
        Guest { vmid, guest_type },
        InstanceInfo {
            id: vmid.to_string(),
            name,
            status: item["status"].as_str().unwrap_or("unknown").to_string(),
            image: None,
            ipv4: None,
            kind: guest_type.kind(),
        },
    ))
}

/// `qm list`: VMID NAME STATUS MEM(MB) BOOTDISK(GB) PID
fn parse_qm_list(output: &str) -> Vec<(Guest, InstanceInfo)> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let vmid: u32 = cols.first()?.parse().ok()?;
            Some(guest_row(vmid, GuestType::Qemu, cols.get(1)?, cols.get(2)?))
        })
        .collect()
}

/// `pct list`: VMID Status Lock Name, where Lock may be blank.
fn parse_pct_list(output: &str) -> Vec<(Guest, InstanceInfo)> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 3 {
                return None;
            }
            let vmid: u32 = cols[0].parse().ok()?;
            Some(guest_row(vmid, GuestType::Lxc, cols[cols.len() - 1], cols[1]))
        })
        .collect()
}

fn guest_row(vmid: u32, guest_type: GuestType, name: &str, status: &str) -> (Guest, InstanceInfo) {
    (
        Guest { vmid, guest_type },
        InstanceInfo {
            id: vmid.to_string(),
            name: name.to_string(),
            status: status.to_ascii_lowercase(),
            image: None,
            ipv4: None,
            kind: guest_type.kind(),
        },
    )
}

/// `pveam list <storage>`: NAME SIZE
fn parse_pveam_list(output: &str) -> Vec<ImageInfo> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let volid = cols.next()?;
            Some(ImageInfo {
                id: volid.to_string(),
                name: volid.rsplit('/').next().unwrap_or(volid).to_string(),
                tag: None,
                size: cols.next().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiAuth;
    use crate::capability::no_progress;
    use crate::transport::mock::MockShell;
    use crate::transport::RemoteShell;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const QM_LIST: &str = "      VMID NAME                 STATUS     MEM(MB)    BOOTDISK(GB) PID\n       100 web                  running    2048              32.00 1234\n";
    const PCT_LIST: &str = "VMID       Status     Lock         Name\n101        stopped                 ct-1\n102        running    backup       ct-2\n";

    fn provider() -> Provider {
        let mut provider = Provider::new(ProviderId::new(9), "pve", ProviderKind::Proxmox, "192.0.2.30");
        provider.vm_enabled = true;
        provider.node_name = Some("pve1".into());
        provider
    }

    fn ssh_backend(shell: &Arc<MockShell>) -> ProxmoxBackend {
        let session = RemoteSession::new(
            Arc::clone(shell) as Arc<dyn RemoteShell>,
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        ProxmoxBackend::with_parts(&provider(), session, None, &BackendOptions::default()).unwrap()
    }

    #[test]
    fn list_parsers() {
        let vms = parse_qm_list(QM_LIST);
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].0.vmid, 100);
        assert_eq!(vms[0].1.kind, InstanceKind::Vm);

        let cts = parse_pct_list(PCT_LIST);
        assert_eq!(cts.len(), 2);
        assert_eq!(cts[0].1.name, "ct-1");
        assert_eq!(cts[0].1.status, "stopped");
        assert_eq!(cts[1].1.name, "ct-2");

        let images = parse_pveam_list(
            "NAME                                                         SIZE\nlocal:vztmpl/debian-12-standard_12.2-1_amd64.tar.zst        120.29MB\n",
        );
        assert_eq!(images[0].name, "debian-12-standard_12.2-1_amd64.tar.zst");
    }

    #[tokio::test]
    async fn ssh_actions_address_guests_by_vmid() {
        let shell = Arc::new(MockShell::new());
        shell.respond("qm list", QM_LIST);
        shell.respond("pct list", PCT_LIST);
        let backend = ssh_backend(&shell);

        backend.start_instance("ct-1").await.unwrap();
        backend.restart_instance("web").await.unwrap();
        assert_eq!(shell.commands_matching("pct start 101").len(), 1);
        assert_eq!(shell.commands_matching("qm reboot 100").len(), 1);

        let err = backend.stop_instance("ghost").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn ssh_delete_purges_and_tolerates_missing() {
        let shell = Arc::new(MockShell::new());
        shell.respond("qm list", QM_LIST);
        shell.respond("pct list", PCT_LIST);
        let backend = ssh_backend(&shell);

        backend.delete_instance("ct-2").await.unwrap();
        assert_eq!(shell.commands_matching("pct stop 102").len(), 1);
        assert_eq!(shell.commands_matching("pct destroy 102 --purge").len(), 1);

        backend.delete_instance("ghost").await.unwrap();
        assert_eq!(shell.commands_matching("destroy").len(), 1);
    }

    #[tokio::test]
    async fn ssh_create_container_from_template() {
        let shell = Arc::new(MockShell::new());
        shell.respond("pvesh get /cluster/nextid", "105\n");
        shell.respond("qm list", QM_LIST);
        shell.respond(
            "pct list",
            "VMID       Status     Lock         Name\n105        running                 app-1\n",
        );
        let backend = ssh_backend(&shell);

        let spec = InstanceSpec {
            name: "app-1".into(),
            kind: InstanceKind::Container,
            image: "debian-12-standard_12.2-1_amd64.tar.zst".into(),
            image_url: None,
            architecture: "amd64".into(),
            cpu: 1,
            memory_mb: 512,
            disk_mb: 1500,
            ports: Vec::new(),
        };
        let info = backend.create_instance_with_progress(&spec, no_progress()).await.unwrap();
        assert_eq!(info.id, "105");

        let create = shell.commands_matching("pct create 105");
        assert_eq!(create.len(), 1);
        assert!(create[0].contains("local:vztmpl/debian-12-standard_12.2-1_amd64.tar.zst"));
        assert!(create[0].contains("--rootfs local-lvm:2"));
        assert_eq!(shell.commands_matching("pct start 105").len(), 1);
    }

    #[tokio::test]
    async fn api_actions_poll_task_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve1/qemu"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"vmid": 100, "name": "web", "status": "stopped"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve1/lxc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api2/json/nodes/pve1/qemu/100/status/start"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": "UPID:pve1:0001:start"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve1/tasks/UPID:pve1:0001:start/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"status": "stopped", "exitstatus": "OK"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), false, Duration::from_secs(5), ApiAuth::None).unwrap();
        let shell = Arc::new(MockShell::new());
        let session = RemoteSession::new(
            Arc::clone(&shell) as Arc<dyn RemoteShell>,
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        let backend = ProxmoxBackend::with_parts(&provider(), session, Some(api), &BackendOptions::default()).unwrap();

        backend.start_instance("web").await.unwrap();
        assert!(shell.commands().is_empty());
    }
}
