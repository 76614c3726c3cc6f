//! Container-engine backend driven over SSH.
//!
//! Docker has no live port-remap primitive: published ports are fixed at
//! `docker run`, so the port-mapping layer recreates containers through
//! [`build_run_command`] instead of editing them in place.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use virtfleet_core::ProviderId;
use virtfleet_store::{ExecutionRule, InstanceKind, Provider, ProviderKind};

use super::image::{CdnConfig, ImageFetcher};
use super::{chpasswd_script, is_missing};
use crate::capability::{
    Connection, HealthCheck, ImageInfo, ImageManagement, InstanceInfo, InstanceSpec, Lifecycle,
    ProgressFn, ProviderBackend,
};
use crate::error::{ProviderError, Result};
use crate::health::{HealthChecker, HealthResult};
use crate::registry::{BackendOptions, ProviderRegistry};
use crate::retry::RetryPolicy;
use crate::transport::{shell_quote, RemoteSession};

/// Register the Docker constructor.
pub fn register(registry: &mut ProviderRegistry) {
    registry.register(
        ProviderKind::Docker,
        Arc::new(|provider, options| {
            Ok(Arc::new(DockerBackend::new(provider, options)?) as Arc<dyn ProviderBackend>)
        }),
    );
}

/// Docker host reached over SSH.
pub struct DockerBackend {
    provider_id: ProviderId,
    session: RemoteSession,
    health: HealthChecker,
    retry: RetryPolicy,
    cdn: CdnConfig,
    container_enabled: bool,
}

impl DockerBackend {
    /// Create a backend for `provider` using the system SSH client.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Unsupported` for `api_only` providers, since
    /// Docker is only driven over SSH.
    pub fn new(provider: &Provider, options: &BackendOptions) -> Result<Self> {
        Self::with_session(provider, RemoteSession::for_provider(provider), options)
    }

    /// Create a backend over an existing session.
    ///
    /// # Errors
    ///
    /// Same as [`DockerBackend::new`].
    pub fn with_session(provider: &Provider, session: RemoteSession, options: &BackendOptions) -> Result<Self> {
        if provider.execution_rule == ExecutionRule::ApiOnly {
            return Err(ProviderError::unsupported(ProviderKind::Docker, "api_only execution"));
        }
        let health = HealthChecker::for_provider(provider, session.shell())?;
        Ok(Self {
            provider_id: provider.id,
            session,
            health,
            retry: RetryPolicy::for_provider(provider, options.retry_attempts),
            cdn: options.cdn.clone(),
            container_enabled: provider.container_enabled,
        })
    }

    /// Make `spec.image` available locally. Returns the archive path when
    /// the image was loaded from a download.
    async fn prepare_image(&self, spec: &InstanceSpec, progress: &ProgressFn) -> Result<Option<String>> {
        let Some(url) = spec.image_url.as_deref() else {
            let image = shell_quote(&spec.image);
            self.session
                .exec(&format!("docker image inspect {image} >/dev/null 2>&1 || docker pull {image}"))
                .await?;
            progress(50, "Image available");
            return Ok(None);
        };

        progress(30, "Downloading image");
        let fetcher = ImageFetcher::new(&self.session, &self.cdn);
        let path = fetcher.download(&spec.image, url, &spec.architecture).await?;

        progress(50, "Loading image");
        if let Err(e) = self.load_archive(&path, &spec.image).await {
            self.discard_image(&spec.image, Some(&path)).await;
            return Err(e);
        }
        Ok(Some(path))
    }

    async fn load_archive(&self, path: &str, target: &str) -> Result<()> {
        let output = self
            .session
            .exec(&format!("docker load -i {}", shell_quote(path)))
            .await?;
        let loaded = parse_loaded_image(&output)
            .ok_or_else(|| ProviderError::Parse(format!("docker load printed no image name: {}", output.trim())))?;
        if loaded != target {
            self.session
                .exec(&format!("docker tag {} {}", shell_quote(&loaded), shell_quote(target)))
                .await?;
        }
        info!(provider_id = %self.provider_id, loaded = %loaded, image = %target, "Image loaded");
        Ok(())
    }

    /// Best-effort removal of a loaded image and its archive.
    async fn discard_image(&self, image: &str, archive: Option<&str>) {
        let commands = [
            format!("docker rmi -f {}", shell_quote(image)),
            "docker image prune -f".to_string(),
        ];
        for command in &commands {
            if let Err(e) = self.session.exec(command).await {
                warn!(provider_id = %self.provider_id, error = %e, "Image cleanup failed");
            }
        }
        if let Some(path) = archive {
            ImageFetcher::new(&self.session, &self.cdn).remove(path).await;
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        match self.session.exec(&format!("docker rm -f {}", shell_quote(name))).await {
            Err(e) if is_missing(&e.to_string()) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn container_command(&self, verb: &str, name: &str) -> Result<()> {
        self.session
            .exec(&format!("docker {verb} {}", shell_quote(name)))
            .await
            .map_err(|e| not_found_or(e, name))?;
        Ok(())
    }
}

#[async_trait]
impl Connection for DockerBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Docker
    }

    async fn connect(&self) -> Result<()> {
        self.session.connect().await?;
        info!(provider_id = %self.provider_id, "Connected to Docker host");
        Ok(())
    }

    async fn disconnect(&self) {
        self.session.disconnect();
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    async fn ensure_connection(&self) -> Result<()> {
        self.session.ensure_connection().await
    }

    async fn execute_ssh_command(&self, command: &str) -> Result<String> {
        self.session.exec(command).await
    }
}

#[async_trait]
impl Lifecycle for DockerBackend {
    fn supported_instance_types(&self) -> Vec<InstanceKind> {
        if self.container_enabled {
            vec![InstanceKind::Container]
        } else {
            Vec::new()
        }
    }

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
        let output = self
            .session
            .exec("docker ps -a --format '{{.ID}}|{{.Names}}|{{.State}}|{{.Image}}'")
            .await?;
        Ok(output.lines().filter_map(parse_ps_line).collect())
    }

    async fn get_instance(&self, name: &str) -> Result<InstanceInfo> {
        let command = format!(
            "docker inspect {} --format '{{{{.Name}}}}|{{{{.State.Status}}}}|{{{{.Config.Image}}}}|{{{{.Id}}}}|{{{{.Created}}}}'",
            shell_quote(name)
        );
        let output = self.session.exec(&command).await.map_err(|e| not_found_or(e, name))?;
        parse_inspect(&output).ok_or_else(|| ProviderError::Parse(format!("docker inspect: {}", output.trim())))
    }

    async fn create_instance_with_progress(&self, spec: &InstanceSpec, progress: ProgressFn) -> Result<InstanceInfo> {
        if spec.kind != InstanceKind::Container {
            return Err(ProviderError::unsupported(ProviderKind::Docker, "virtual machines"));
        }

        progress(10, "Preparing image");
        let archive = self.prepare_image(spec, &progress).await?;

        progress(70, "Creating container");
        let created = match self.session.exec(&build_run_command(spec)).await {
            Ok(_) => {
                progress(90, "Verifying container");
                self.get_instance(&spec.name).await
            }
            Err(e) => Err(e),
        };

        match created {
            Ok(info) => {
                progress(100, "Container ready");
                info!(provider_id = %self.provider_id, instance = %spec.name, "Container created");
                Ok(info)
            }
            Err(e) => {
                warn!(provider_id = %self.provider_id, instance = %spec.name, error = %e, "Container creation failed, cleaning up");
                if let Err(cleanup) = self.remove_container(&spec.name).await {
                    warn!(instance = %spec.name, error = %cleanup, "Failed to remove partial container");
                }
                if archive.is_some() {
                    self.discard_image(&spec.image, archive.as_deref()).await;
                }
                Err(e)
            }
        }
    }

    async fn start_instance(&self, name: &str) -> Result<()> {
        self.container_command("start", name).await
    }

    async fn stop_instance(&self, name: &str) -> Result<()> {
        self.container_command("stop", name).await
    }

    async fn restart_instance(&self, name: &str) -> Result<()> {
        self.container_command("restart", name).await
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        self.retry
            .run("delete_instance", self, || self.remove_container(name))
            .await?;
        info!(provider_id = %self.provider_id, instance = %name, "Container deleted");
        Ok(())
    }

    async fn set_instance_password(&self, name: &str, password: &str) -> Result<()> {
        let command = format!("docker exec {} {}", shell_quote(name), chpasswd_script(password));
        self.session.exec(&command).await.map_err(|e| not_found_or(e, name))?;
        Ok(())
    }
}

#[async_trait]
impl ImageManagement for DockerBackend {
    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let output = self
            .session
            .exec("docker images --format 'table {{.Repository}}\\t{{.Tag}}\\t{{.ID}}\\t{{.Size}}\\t{{.CreatedAt}}'")
            .await?;
        Ok(parse_images(&output))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.session.exec(&format!("docker pull {}", shell_quote(image))).await?;
        Ok(())
    }

    async fn delete_image(&self, image: &str) -> Result<()> {
        self.session.exec(&format!("docker rmi -f {}", shell_quote(image))).await?;
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for DockerBackend {
    async fn health_check(&self, collect_resources: bool) -> Result<HealthResult> {
        Ok(self.health.check_health(collect_resources).await)
    }
}

fn not_found_or(e: ProviderError, name: &str) -> ProviderError {
    if !e.is_connectivity() && is_missing(&e.to_string()) {
        ProviderError::NotFound(format!("container {name}"))
    } else {
        e
    }
}

/// The `docker run` command that creates a container from `spec`.
///
/// Ports bind on IPv4 only; `both` publishes a tcp and a udp rule.
#[must_use]
pub fn build_run_command(spec: &InstanceSpec) -> String {
    let mut cmd = format!("docker run -d --name {}", shell_quote(&spec.name));
    if spec.memory_mb > 0 {
        cmd.push_str(&format!(" --memory={}m", spec.memory_mb));
    }
    if spec.cpu > 0 {
        cmd.push_str(&format!(" --cpus={}", spec.cpu));
    }
    for port in &spec.ports {
        for protocol in port.protocol.expand() {
            cmd.push_str(&format!(
                " -p 0.0.0.0:{}:{}/{}",
                port.host_port,
                port.guest_port,
                protocol.as_str()
            ));
        }
    }
    cmd.push_str(" --cap-add=MKNOD ");
    cmd.push_str(&shell_quote(&spec.image));
    cmd
}

fn normalize_status(state: &str) -> String {
    match state.trim().to_ascii_lowercase().as_str() {
        "exited" | "created" | "dead" => "stopped".to_string(),
        other => other.to_string(),
    }
}

/// Parse one line of `docker ps --format '{{.ID}}|{{.Names}}|{{.State}}|{{.Image}}'`.
fn parse_ps_line(line: &str) -> Option<InstanceInfo> {
    let mut parts = line.trim().split('|');
    let id = parts.next().filter(|s| !s.is_empty())?;
    let name = parts.next()?;
    let state = parts.next()?;
    let image = parts.next();
    Some(InstanceInfo {
        id: id.to_string(),
        name: name.to_string(),
        status: normalize_status(state),
        image: image.map(ToString::to_string),
        ipv4: None,
        kind: InstanceKind::Container,
    })
}

/// Parse `docker inspect --format '{{.Name}}|{{.State.Status}}|{{.Config.Image}}|{{.Id}}|{{.Created}}'`.
fn parse_inspect(output: &str) -> Option<InstanceInfo> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let parts: Vec<&str> = line.trim().split('|').collect();
    if parts.len() < 4 {
        return None;
    }
    Some(InstanceInfo {
        id: parts[3].to_string(),
        name: parts[0].trim_start_matches('/').to_string(),
        status: normalize_status(parts[1]),
        image: Some(parts[2].to_string()),
        ipv4: None,
        kind: InstanceKind::Container,
    })
}

/// Parse the tab-separated `docker images` table, skipping the header.
fn parse_images(output: &str) -> Vec<ImageInfo> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('\t').map(str::trim).collect();
            if parts.len() < 4 {
                return None;
            }
            Some(ImageInfo {
                id: parts[2].to_string(),
                name: parts[0].to_string(),
                tag: Some(parts[1].to_string()).filter(|t| t != "<none>"),
                size: parts[3].to_string(),
            })
        })
        .collect()
}

/// Extract the image reference from `docker load` output.
fn parse_loaded_image(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let line = line.trim();
        line.strip_prefix("Loaded image:")
            .or_else(|| line.strip_prefix("Loaded image ID:"))
            .map(|rest| rest.trim().to_string())
            .filter(|rest| !rest.is_empty())
    })
}
