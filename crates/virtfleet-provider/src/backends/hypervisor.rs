//! LXD and Incus hypervisor backend.
//!
//! Both daemons share a REST API and a CLI that differ only in the binary
//! name, so one implementation serves both, parameterized by [`CliFlavor`].
//! The REST API is preferred when a client certificate is configured and the
//! provider is not `ssh_only`; otherwise the CLI is driven over SSH.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{info, warn};
use virtfleet_core::ProviderId;
use virtfleet_store::{ExecutionRule, InstanceKind, Provider, ProviderKind};

use super::image::{CdnConfig, ImageFetcher};
use super::{chpasswd_pipeline, chpasswd_script, is_missing};
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

/// Public simplestreams server for `images:` aliases.
const IMAGES_SERVER: &str = "https://images.linuxcontainers.org";

/// Seconds a state change may take before the daemon gives up.
const STATE_TIMEOUT_SECS: u32 = 30;

/// CLI binary of a hypervisor daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliFlavor {
    /// LXD (`lxc`).
    Lxd,
    /// Incus (`incus`).
    Incus,
}

impl CliFlavor {
    /// Flavor of a provider kind.
    #[must_use]
    pub const fn for_kind(kind: ProviderKind) -> Option<Self> {
        match kind {
            ProviderKind::Lxd => Some(Self::Lxd),
            ProviderKind::Incus => Some(Self::Incus),
            ProviderKind::Docker | ProviderKind::Proxmox => None,
        }
    }

    /// CLI binary name.
    #[must_use]
    pub const fn binary(self) -> &'static str {
        match self {
            Self::Lxd => "lxc",
            Self::Incus => "incus",
        }
    }

    /// Provider kind.
    #[must_use]
    pub const fn kind(self) -> ProviderKind {
        match self {
            Self::Lxd => ProviderKind::Lxd,
            Self::Incus => ProviderKind::Incus,
        }
    }
}

/// Register the LXD and Incus constructors.
pub fn register(registry: &mut ProviderRegistry) {
    for kind in [ProviderKind::Lxd, ProviderKind::Incus] {
        registry.register(
            kind,
            Arc::new(|provider, options| {
                Ok(Arc::new(HypervisorBackend::new(provider, options)?) as Arc<dyn ProviderBackend>)
            }),
        );
    }
}

/// LXD or Incus host.
pub struct HypervisorBackend {
    provider_id: ProviderId,
    flavor: CliFlavor,
    session: RemoteSession,
    api: Option<ApiClient>,
    api_only: bool,
    api_connected: AtomicBool,
    health: HealthChecker,
    retry: RetryPolicy,
    cdn: CdnConfig,
    container_enabled: bool,
    vm_enabled: bool,
}

impl HypervisorBackend {
    /// Create a backend for `provider`.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::InvalidConfig` if the provider is not LXD or
    /// Incus, or is `api_only` without API credentials.
    pub fn new(provider: &Provider, options: &BackendOptions) -> Result<Self> {
        let api = ApiClient::for_provider(provider)?;
        Self::with_parts(provider, RemoteSession::for_provider(provider), api, options)
    }

    /// Create a backend from an existing session and optional API client.
    ///
    /// # Errors
    ///
    /// Same as [`HypervisorBackend::new`].
    pub fn with_parts(
        provider: &Provider,
        session: RemoteSession,
        api: Option<ApiClient>,
        options: &BackendOptions,
    ) -> Result<Self> {
        let flavor = CliFlavor::for_kind(provider.kind).ok_or_else(|| {
            ProviderError::InvalidConfig(format!("{} is not a hypervisor provider", provider.kind.as_str()))
        })?;
        let api_only = provider.execution_rule == ExecutionRule::ApiOnly;
        if api_only && api.is_none() {
            return Err(ProviderError::InvalidConfig(
                "api_only requires a client certificate and key".to_string(),
            ));
        }
        let health = HealthChecker::for_provider(provider, session.shell())?;
        Ok(Self {
            provider_id: provider.id,
            flavor,
            session,
            api,
            api_only,
            api_connected: AtomicBool::new(false),
            health,
            retry: RetryPolicy::for_provider(provider, options.retry_attempts),
            cdn: options.cdn.clone(),
            container_enabled: provider.container_enabled,
            vm_enabled: provider.vm_enabled,
        })
    }

    fn cli(&self) -> &'static str {
        self.flavor.binary()
    }

    /// Wait for an asynchronous operation returned by the API.
    async fn wait(api: &ApiClient, response: &Value) -> Result<()> {
        let Some(operation) = response
            .get("operation")
            .and_then(Value::as_str)
            .filter(|op| !op.is_empty())
        else {
            return Ok(());
        };
        let done = api.get(&format!("{operation}/wait?timeout=600")).await?;
        let metadata = &done["metadata"];
        match metadata["status_code"].as_u64() {
            None | Some(200) => Ok(()),
            Some(code) => Err(ProviderError::command(
                operation,
                i32::try_from(code).ok(),
                metadata["err"].as_str().unwrap_or("operation failed"),
            )),
        }
    }

    async fn api_call(api: &ApiClient, method: Method, path: &str, body: Option<&Value>) -> Result<()> {
        let response = api.request(method, path, body).await?;
        Self::wait(api, &response).await
    }

    async fn change_state(&self, name: &str, action: &str, force: bool) -> Result<()> {
        if let Some(api) = &self.api {
            let body = json!({"action": action, "timeout": STATE_TIMEOUT_SECS, "force": force});
            return Self::api_call(api, Method::PUT, &format!("/1.0/instances/{name}/state"), Some(&body))
                .await
                .map_err(|e| not_found_or(e, name));
        }
        let extra = if force { " --force" } else { "" };
        self.session
            .exec(&format!("{} {action} {}{extra}", self.cli(), shell_quote(name)))
            .await
            .map_err(|e| not_found_or(e, name))?;
        Ok(())
    }

    async fn remove_instance(&self, name: &str) -> Result<()> {
        let result = if let Some(api) = &self.api {
            match self.change_state(name, "stop", true).await {
                Err(e) if !e.is_connectivity() && !matches!(e, ProviderError::NotFound(_)) => {
                    // Already stopped instances reject a stop; the delete decides.
                    warn!(instance = %name, error = %e, "Stop before delete failed");
                }
                Err(e) if e.is_connectivity() => return Err(e),
                _ => {}
            }
            Self::api_call(api, Method::DELETE, &format!("/1.0/instances/{name}"), None).await
        } else {
            self.session
                .exec(&format!("{} delete {} --force", self.cli(), shell_quote(name)))
                .await
                .map(|_| ())
        };
        match result {
            Err(ProviderError::NotFound(_)) => Ok(()),
            Err(e) if !e.is_connectivity() && is_missing(&e.to_string()) => Ok(()),
            other => other,
        }
    }

    /// Make the image alias available; returns the alias to launch from.
    async fn prepare_image(&self, spec: &InstanceSpec, progress: &ProgressFn) -> Result<String> {
        let Some(url) = spec.image_url.as_deref() else {
            progress(50, "Image available");
            return Ok(spec.image.clone());
        };
        if self.api_only {
            return Err(ProviderError::unsupported(self.flavor.kind(), "archive import without SSH"));
        }

        progress(30, "Downloading image");
        let fetcher = ImageFetcher::new(&self.session, &self.cdn);
        let path = fetcher.download(&spec.image, url, &spec.architecture).await?;

        progress(50, "Importing image");
        let alias = shell_quote(&spec.image);
        let command = format!(
            "{cli} image info {alias} >/dev/null 2>&1 || {cli} image import {} --alias {alias}",
            shell_quote(&path),
            cli = self.cli(),
        );
        if let Err(e) = self.session.exec(&command).await {
            fetcher.remove(&path).await;
            return Err(e);
        }
        Ok(spec.image.clone())
    }

    async fn create_via_api(&self, api: &ApiClient, spec: &InstanceSpec, image: &str) -> Result<()> {
        let body = json!({
            "name": spec.name,
            "type": if spec.kind == InstanceKind::Vm { "virtual-machine" } else { "container" },
            "source": image_source(image),
            "config": {
                "limits.cpu": spec.cpu.to_string(),
                "limits.memory": format!("{}MiB", spec.memory_mb),
            },
            "devices": {
                "root": {"path": "/", "pool": "default", "type": "disk", "size": format!("{}MiB", spec.disk_mb)},
            },
        });
        Self::api_call(api, Method::POST, "/1.0/instances", Some(&body)).await
    }

    async fn create_via_cli(&self, spec: &InstanceSpec, image: &str) -> Result<()> {
        let vm = if spec.kind == InstanceKind::Vm { " --vm" } else { "" };
        let command = format!(
            "{} init {} {}{vm} -c limits.cpu={} -c limits.memory={}MiB -d root,size={}MiB",
            self.cli(),
            shell_quote(image),
            shell_quote(&spec.name),
            spec.cpu,
            spec.memory_mb,
            spec.disk_mb,
        );
        self.session.exec(&command).await.map(|_| ())
    }
}

#[async_trait]
impl Connection for HypervisorBackend {
    fn kind(&self) -> ProviderKind {
        self.flavor.kind()
    }

    async fn connect(&self) -> Result<()> {
        if self.api_only {
            if let Some(api) = &self.api {
                api.get("/1.0").await?;
                self.api_connected.store(true, Ordering::SeqCst);
            }
        } else {
            self.session.connect().await?;
        }
        info!(provider_id = %self.provider_id, kind = self.flavor.kind().as_str(), "Connected to hypervisor host");
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
            return Err(ProviderError::unsupported(self.flavor.kind(), "ssh commands on api_only providers"));
        }
        self.session.exec(command).await
    }
}

#[async_trait]
impl Lifecycle for HypervisorBackend {
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
        if let Some(api) = &self.api {
            let body = api.get("/1.0/instances?recursion=2").await?;
            return Ok(body["metadata"]
                .as_array()
                .map(|items| items.iter().filter_map(parse_api_instance).collect())
                .unwrap_or_default());
        }
        let output = self
            .session
            .exec(&format!("{} list --format csv -c nst4", self.cli()))
            .await?;
        Ok(parse_csv(&output).iter().filter_map(|row| parse_cli_instance(row)).collect())
    }

    async fn get_instance(&self, name: &str) -> Result<InstanceInfo> {
        if let Some(api) = &self.api {
            let body = api
                .get(&format!("/1.0/instances/{name}?recursion=1"))
                .await
                .map_err(|e| not_found_or(e, name))?;
            return parse_api_instance(&body["metadata"])
                .ok_or_else(|| ProviderError::Parse(format!("instance {name}: unexpected API payload")));
        }
        let output = self
            .session
            .exec(&format!("{} list {} --format csv -c nst4", self.cli(), shell_quote(name)))
            .await?;
        parse_csv(&output)
            .iter()
            .filter_map(|row| parse_cli_instance(row))
            .find(|info| info.name == name)
            .ok_or_else(|| ProviderError::NotFound(format!("instance {name}")))
    }

    async fn create_instance_with_progress(&self, spec: &InstanceSpec, progress: ProgressFn) -> Result<InstanceInfo> {
        if !self.supported_instance_types().contains(&spec.kind) {
            return Err(ProviderError::unsupported(self.flavor.kind(), "instance kind disabled on this provider"));
        }

        progress(10, "Preparing image");
        let image = self.prepare_image(spec, &progress).await?;

        progress(70, "Creating instance");
        let created = match &self.api {
            Some(api) => self.create_via_api(api, spec, &image).await,
            None => self.create_via_cli(spec, &image).await,
        };

        let started = match created {
            Ok(()) => {
                progress(90, "Starting instance");
                match self.change_state(&spec.name, "start", false).await {
                    Ok(()) => self.get_instance(&spec.name).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        match started {
            Ok(info) => {
                progress(100, "Instance ready");
                info!(provider_id = %self.provider_id, instance = %spec.name, "Instance created");
                Ok(info)
            }
            Err(e) => {
                warn!(provider_id = %self.provider_id, instance = %spec.name, error = %e, "Instance creation failed, cleaning up");
                if let Err(cleanup) = self.remove_instance(&spec.name).await {
                    warn!(instance = %spec.name, error = %cleanup, "Failed to remove partial instance");
                }
                Err(e)
            }
        }
    }

    async fn start_instance(&self, name: &str) -> Result<()> {
        self.change_state(name, "start", false).await
    }

    async fn stop_instance(&self, name: &str) -> Result<()> {
        self.change_state(name, "stop", false).await
    }

    async fn restart_instance(&self, name: &str) -> Result<()> {
        self.change_state(name, "restart", false).await
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        self.retry
            .run("delete_instance", self, || self.remove_instance(name))
            .await?;
        info!(provider_id = %self.provider_id, instance = %name, "Instance deleted");
        Ok(())
    }

    async fn set_instance_password(&self, name: &str, password: &str) -> Result<()> {
        if let Some(api) = &self.api {
            let body = json!({
                "command": ["sh", "-c", chpasswd_pipeline(password)],
                "wait-for-websocket": false,
                "interactive": false,
            });
            return Self::api_call(api, Method::POST, &format!("/1.0/instances/{name}/exec"), Some(&body))
                .await
                .map_err(|e| not_found_or(e, name));
        }
        let command = format!("{} exec {} -- {}", self.cli(), shell_quote(name), chpasswd_script(password));
        self.session.exec(&command).await.map_err(|e| not_found_or(e, name))?;
        Ok(())
    }
}

#[async_trait]
impl ImageManagement for HypervisorBackend {
    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        if let Some(api) = &self.api {
            let body = api.get("/1.0/images?recursion=1").await?;
            return Ok(body["metadata"]
                .as_array()
                .map(|items| items.iter().filter_map(parse_api_image).collect())
                .unwrap_or_default());
        }
        let output = self
            .session
            .exec(&format!("{} image list --format csv -c lfsu", self.cli()))
            .await?;
        Ok(parse_csv(&output)
            .into_iter()
            .filter(|row| row.len() >= 3)
            .map(|row| ImageInfo {
                id: row[1].clone(),
                name: row[0].clone(),
                tag: None,
                size: row[2].clone(),
            })
            .collect())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let alias = image.strip_prefix("images:").unwrap_or(image);
        if let Some(api) = &self.api {
            let body = json!({
                "source": {"type": "image", "mode": "pull", "server": IMAGES_SERVER, "protocol": "simplestreams", "alias": alias},
                "aliases": [{"name": alias}],
            });
            return Self::api_call(api, Method::POST, "/1.0/images", Some(&body)).await;
        }
        let command = format!(
            "{} image copy images:{} local: --alias {}",
            self.cli(),
            shell_quote(alias),
            shell_quote(alias)
        );
        self.session.exec(&command).await.map(|_| ())
    }

    async fn delete_image(&self, image: &str) -> Result<()> {
        if let Some(api) = &self.api {
            let alias = api.get(&format!("/1.0/images/aliases/{image}")).await?;
            let fingerprint = alias["metadata"]["target"]
                .as_str()
                .ok_or_else(|| ProviderError::Parse(format!("alias {image} has no target")))?;
            return Self::api_call(api, Method::DELETE, &format!("/1.0/images/{fingerprint}"), None).await;
        }
        self.session
            .exec(&format!("{} image delete {}", self.cli(), shell_quote(image)))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl HealthCheck for HypervisorBackend {
    async fn health_check(&self, collect_resources: bool) -> Result<HealthResult> {
        Ok(self.health.check_health(collect_resources).await)
    }
}

fn not_found_or(e: ProviderError, name: &str) -> ProviderError {
    if matches!(e, ProviderError::NotFound(_)) || (!e.is_connectivity() && is_missing(&e.to_string())) {
        ProviderError::NotFound(format!("instance {name}"))
    } else {
        e
    }
}

/// API `source` object for an image reference; `images:` aliases pull from
/// the public simplestreams server.
fn image_source(image: &str) -> Value {
    match image.strip_prefix("images:") {
        Some(alias) => json!({
            "type": "image",
            "mode": "pull",
            "server": IMAGES_SERVER,
            "protocol": "simplestreams",
            "alias": alias,
        }),
        None => json!({"type": "image", "alias": image}),
    }
}

fn kind_from_type(value: &str) -> InstanceKind {
    let lower = value.to_ascii_lowercase();
    if lower.contains("virtual") {
        InstanceKind::Vm
    } else {
        InstanceKind::Container
    }
}

/// Instance object from `GET /1.0/instances?recursion=2`.
fn parse_api_instance(item: &Value) -> Option<InstanceInfo> {
    let name = item["name"].as_str()?;
    let ipv4 = item["state"]["network"].as_object().and_then(|nics| {
        nics.iter()
            .filter(|(nic, _)| nic.as_str() != "lo")
            .flat_map(|(_, nic)| nic["addresses"].as_array().cloned().unwrap_or_default())
            .find(|addr| addr["family"] == "inet")
            .and_then(|addr| addr["address"].as_str().map(ToString::to_string))
    });
    Some(InstanceInfo {
        id: name.to_string(),
        name: name.to_string(),
        status: item["status"].as_str().unwrap_or("unknown").to_ascii_lowercase(),
        image: item["config"]["image.description"].as_str().map(ToString::to_string),
        ipv4,
        kind: kind_from_type(item["type"].as_str().unwrap_or("container")),
    })
}

fn parse_api_image(item: &Value) -> Option<ImageInfo> {
    let fingerprint = item["fingerprint"].as_str()?;
    let name = item["aliases"]
        .as_array()
        .and_then(|aliases| aliases.first())
        .and_then(|alias| alias["name"].as_str())
        .unwrap_or(fingerprint);
    Some(ImageInfo {
        id: fingerprint.to_string(),
        name: name.to_string(),
        tag: None,
        size: item["size"].as_u64().map(|b| format!("{:.2}MB", b as f64 / 1_048_576.0)).unwrap_or_default(),
    })
}

/// Row of `list --format csv -c nst4`: name, state, type, IPv4 list.
fn parse_cli_instance(row: &[String]) -> Option<InstanceInfo> {
    let name = row.first().filter(|n| !n.is_empty())?;
    let ipv4 = row
        .get(3)
        .and_then(|ips| ips.lines().next())
        .and_then(|ip| ip.split_whitespace().next())
        .map(ToString::to_string);
    Some(InstanceInfo {
        id: name.clone(),
        name: name.clone(),
        status: row.get(1).map_or_else(|| "unknown".to_string(), |s| s.to_ascii_lowercase()),
        image: None,
        ipv4,
        kind: kind_from_type(row.get(2).map_or("", String::as_str)),
    })
}

/// Minimal CSV reader: comma separated, double-quoted fields may contain
/// commas, newlines, and doubled quotes.
fn parse_csv(input: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', _) => quoted = !quoted,
            (',', false) => row.push(std::mem::take(&mut field)),
            ('\n', false) => {
                row.push(std::mem::take(&mut field));
                if row.iter().any(|f| !f.is_empty()) {
                    rows.push(std::mem::take(&mut row));
                } else {
                    row.clear();
                }
            }
            ('\r', false) => {}
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiAuth;
    use crate::capability::no_progress;
    use crate::transport::mock::MockShell;
    use crate::transport::RemoteShell;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(kind: ProviderKind) -> Provider {
        let mut provider = Provider::new(ProviderId::new(5), "hv", kind, "192.0.2.20");
        provider.vm_enabled = true;
        provider
    }

    fn session(shell: &Arc<MockShell>) -> RemoteSession {
        RemoteSession::new(
            Arc::clone(shell) as Arc<dyn RemoteShell>,
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
    }

    fn spec(kind: InstanceKind) -> InstanceSpec {
        InstanceSpec {
            name: "vm-7".into(),
            kind,
            image: "images:debian/12".into(),
            image_url: None,
            architecture: "amd64".into(),
            cpu: 2,
            memory_mb: 2048,
            disk_mb: 20480,
            ports: Vec::new(),
        }
    }

    #[test]
    fn csv_handles_multiline_quoted_fields() {
        let rows = parse_csv("web,RUNNING,CONTAINER,\"10.0.0.5 (eth0)\n172.17.0.1 (docker0)\"\ndb,STOPPED,VIRTUAL-MACHINE,\n");
        assert_eq!(rows.len(), 2);
        let web = parse_cli_instance(&rows[0]).unwrap();
        assert_eq!(web.ipv4.as_deref(), Some("10.0.0.5"));
        assert_eq!(web.status, "running");
        let db = parse_cli_instance(&rows[1]).unwrap();
        assert_eq!(db.kind, InstanceKind::Vm);
        assert!(db.ipv4.is_none());
    }

    #[tokio::test]
    async fn incus_cli_create_uses_incus_binary() {
        let shell = Arc::new(MockShell::new());
        shell.respond("incus list", "vm-7,RUNNING,VIRTUAL-MACHINE,\"10.1.0.9 (enp5s0)\"\n");
        let backend = HypervisorBackend::with_parts(
            &provider(ProviderKind::Incus),
            session(&shell),
            None,
            &BackendOptions::default(),
        )
        .unwrap();

        let info = backend.create_instance_with_progress(&spec(InstanceKind::Vm), no_progress()).await.unwrap();
        assert_eq!(info.ipv4.as_deref(), Some("10.1.0.9"));

        let init = shell.commands_matching("incus init");
        assert_eq!(init.len(), 1);
        assert!(init[0].contains(" --vm "));
        assert!(init[0].contains("limits.memory=2048MiB"));
        assert_eq!(shell.commands_matching("incus start vm-7").len(), 1);
        assert!(shell.commands_matching("lxc ").is_empty());
    }

    #[tokio::test]
    async fn failed_start_deletes_partial_instance() {
        let shell = Arc::new(MockShell::new());
        shell.respond_failure("lxc start", "Error: Failed to start device", 1);
        let backend = HypervisorBackend::with_parts(
            &provider(ProviderKind::Lxd),
            session(&shell),
            None,
            &BackendOptions::default(),
        )
        .unwrap();

        assert!(backend.create_instance(&spec(InstanceKind::Container)).await.is_err());
        assert_eq!(shell.commands_matching("lxc delete vm-7 --force").len(), 1);
    }

    #[tokio::test]
    async fn disabled_kind_is_rejected() {
        let shell = Arc::new(MockShell::new());
        let mut p = provider(ProviderKind::Lxd);
        p.vm_enabled = false;
        let backend = HypervisorBackend::with_parts(&p, session(&shell), None, &BackendOptions::default()).unwrap();

        let err = backend.create_instance(&spec(InstanceKind::Vm)).await.unwrap_err();
        assert_eq!(err.kind(), virtfleet_core::ErrorKind::Capability);
        assert!(shell.commands().is_empty());
    }

    #[tokio::test]
    async fn api_state_change_waits_for_operation() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/1.0/instances/web/state"))
            .and(body_partial_json(json!({"action": "stop"})))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "type": "async",
                "operation": "/1.0/operations/op-1"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/1.0/operations/op-1/wait"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "metadata": {"status_code": 200}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), false, Duration::from_secs(5), ApiAuth::None).unwrap();
        let shell = Arc::new(MockShell::new());
        let backend = HypervisorBackend::with_parts(
            &provider(ProviderKind::Lxd),
            session(&shell),
            Some(api),
            &BackendOptions::default(),
        )
        .unwrap();

        backend.stop_instance("web").await.unwrap();
        assert!(shell.commands_matching("lxc stop").is_empty());
    }

    #[tokio::test]
    async fn api_operation_failure_surfaces_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"operation": "/1.0/operations/op-2"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/1.0/operations/op-2/wait"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "metadata": {"status_code": 400, "err": "The instance is already running"}
            })))
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), false, Duration::from_secs(5), ApiAuth::None).unwrap();
        let backend = HypervisorBackend::with_parts(
            &provider(ProviderKind::Lxd),
            session(&Arc::new(MockShell::new())),
            Some(api),
            &BackendOptions::default(),
        )
        .unwrap();

        let err = backend.start_instance("web").await.unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn api_only_without_credentials_is_invalid() {
        let mut p = provider(ProviderKind::Lxd);
        p.execution_rule = ExecutionRule::ApiOnly;
        let err = HypervisorBackend::with_parts(
            &p,
            session(&Arc::new(MockShell::new())),
            None,
            &BackendOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ProviderError::InvalidConfig(_)));
    }

    #[test]
    fn api_instance_payload() {
        let item = json!({
            "name": "web",
            "status": "Running",
            "type": "container",
            "state": {"network": {
                "lo": {"addresses": [{"family": "inet", "address": "127.0.0.1"}]},
                "eth0": {"addresses": [{"family": "inet6", "address": "fd42::1"}, {"family": "inet", "address": "10.0.0.8"}]}
            }}
        });
        let info = parse_api_instance(&item).unwrap();
        assert_eq!(info.status, "running");
        assert_eq!(info.ipv4.as_deref(), Some("10.0.0.8"));
    }
}
