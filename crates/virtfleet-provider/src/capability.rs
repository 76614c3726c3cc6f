//! Per-concern capability traits implemented by every backend.
//!
//! A backend is the union of [`Connection`], [`Lifecycle`],
//! [`ImageManagement`] and [`HealthCheck`]. Operations a backend cannot
//! perform keep their default body, which returns
//! [`ProviderError::Unsupported`] instead of silently doing nothing.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use virtfleet_store::{Instance, InstanceKind, PortMapping, Protocol, ProviderKind};

use crate::error::{ProviderError, Result};
use crate::health::HealthResult;

/// Progress callback: percentage and a short message.
pub type ProgressFn = Arc<dyn Fn(u8, &str) + Send + Sync>;

/// A progress callback that discards updates.
#[must_use]
pub fn no_progress() -> ProgressFn {
    Arc::new(|_, _| {})
}

/// A published port requested at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortSpec {
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the instance.
    pub guest_port: u16,
    /// Protocol.
    pub protocol: Protocol,
}

impl From<&PortMapping> for PortSpec {
    fn from(mapping: &PortMapping) -> Self {
        Self {
            host_port: mapping.host_port,
            guest_port: mapping.guest_port,
            protocol: mapping.protocol,
        }
    }
}

/// Everything a backend needs to create an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Instance name on the backend.
    pub name: String,
    /// Container or VM.
    pub kind: InstanceKind,
    /// Image name, alias, or template.
    pub image: String,
    /// Archive to download the image from.
    pub image_url: Option<String>,
    /// Target architecture.
    pub architecture: String,
    /// CPU cores.
    pub cpu: u32,
    /// Memory in megabytes.
    pub memory_mb: u64,
    /// Disk in megabytes.
    pub disk_mb: u64,
    /// Ports published at creation; only honoured by backends without
    /// dynamic mapping.
    pub ports: Vec<PortSpec>,
}

impl InstanceSpec {
    /// Build the spec of a stored instance with its mappings.
    #[must_use]
    pub fn from_instance(instance: &Instance, mappings: &[PortMapping]) -> Self {
        Self {
            name: instance.name.clone(),
            kind: instance.kind,
            image: instance.image.clone(),
            image_url: instance.image_url.clone(),
            architecture: instance.architecture.clone(),
            cpu: instance.resources.cpu,
            memory_mb: instance.resources.memory_mb,
            disk_mb: instance.resources.disk_mb,
            ports: mappings.iter().map(PortSpec::from).collect(),
        }
    }
}

/// An instance as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Backend identifier (container id, vmid, or name).
    pub id: String,
    /// Instance name.
    pub name: String,
    /// Backend status, lowercased (`running`, `stopped`, ...).
    pub status: String,
    /// Image the instance was created from, when known.
    pub image: Option<String>,
    /// First IPv4 address, when known.
    pub ipv4: Option<String>,
    /// Container or VM.
    pub kind: InstanceKind,
}

impl InstanceInfo {
    /// Returns true if the backend reports the instance as running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// An image available on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Backend identifier or fingerprint.
    pub id: String,
    /// Repository, alias, or template name.
    pub name: String,
    /// Tag, if the backend has tags.
    pub tag: Option<String>,
    /// Human-readable size as reported by the backend.
    pub size: String,
}

/// Connection management.
///
/// Each backend owns its connection state; a task's remote calls may span
/// minutes, so callers use [`Connection::ensure_connection`] before work.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Backend family.
    fn kind(&self) -> ProviderKind;

    /// Establish the connection.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error if the host cannot be reached.
    async fn connect(&self) -> Result<()>;

    /// Drop the connection.
    async fn disconnect(&self);

    /// Returns true if the backend believes it is connected.
    fn is_connected(&self) -> bool;

    /// Reconnect if needed.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error if the host cannot be reached.
    async fn ensure_connection(&self) -> Result<()>;

    /// Run a shell command on the host and return its stdout.
    ///
    /// # Errors
    ///
    /// Returns a classified error for transport failures and non-zero exits.
    async fn execute_ssh_command(&self, command: &str) -> Result<String>;
}

/// Instance lifecycle.
#[async_trait]
pub trait Lifecycle: Connection {
    /// Instance kinds this provider is configured to host.
    fn supported_instance_types(&self) -> Vec<InstanceKind>;

    /// List every instance on the host.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Unsupported` if the backend cannot list.
    async fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
        Err(ProviderError::unsupported(self.kind(), "list_instances"))
    }

    /// Look up one instance by name.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::NotFound` if it does not exist.
    async fn get_instance(&self, name: &str) -> Result<InstanceInfo> {
        let _ = name;
        Err(ProviderError::unsupported(self.kind(), "get_instance"))
    }

    /// Create and start an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails; partial resources are removed.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceInfo> {
        self.create_instance_with_progress(spec, no_progress()).await
    }

    /// Create and start an instance, reporting progress.
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails; partial resources are removed.
    async fn create_instance_with_progress(
        &self,
        spec: &InstanceSpec,
        progress: ProgressFn,
    ) -> Result<InstanceInfo> {
        let _ = (spec, progress);
        Err(ProviderError::unsupported(self.kind(), "create_instance"))
    }

    /// Start a stopped instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the operation.
    async fn start_instance(&self, name: &str) -> Result<()> {
        let _ = name;
        Err(ProviderError::unsupported(self.kind(), "start_instance"))
    }

    /// Stop a running instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the operation.
    async fn stop_instance(&self, name: &str) -> Result<()> {
        let _ = name;
        Err(ProviderError::unsupported(self.kind(), "stop_instance"))
    }

    /// Restart an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the operation.
    async fn restart_instance(&self, name: &str) -> Result<()> {
        let _ = name;
        Err(ProviderError::unsupported(self.kind(), "restart_instance"))
    }

    /// Delete an instance. Deleting an absent instance succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the operation after retries.
    async fn delete_instance(&self, name: &str) -> Result<()> {
        let _ = name;
        Err(ProviderError::unsupported(self.kind(), "delete_instance"))
    }

    /// Set the root password inside an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the operation.
    async fn set_instance_password(&self, name: &str, password: &str) -> Result<()> {
        let _ = (name, password);
        Err(ProviderError::unsupported(self.kind(), "set_instance_password"))
    }
}

/// Image management.
#[async_trait]
pub trait ImageManagement: Connection {
    /// List images available on the host.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Unsupported` if the backend cannot list images.
    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        Err(ProviderError::unsupported(self.kind(), "list_images"))
    }

    /// Fetch an image onto the host.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Unsupported` if the backend cannot pull images.
    async fn pull_image(&self, image: &str) -> Result<()> {
        let _ = image;
        Err(ProviderError::unsupported(self.kind(), "pull_image"))
    }

    /// Remove an image from the host.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Unsupported` if the backend cannot delete images.
    async fn delete_image(&self, image: &str) -> Result<()> {
        let _ = image;
        Err(ProviderError::unsupported(self.kind(), "delete_image"))
    }
}

/// Host health.
#[async_trait]
pub trait HealthCheck: Connection {
    /// Run the configured health checks, harvesting static facts when
    /// `collect_resources` is set.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Unsupported` if the backend has no checker.
    async fn health_check(&self, collect_resources: bool) -> Result<HealthResult> {
        let _ = collect_resources;
        Err(ProviderError::unsupported(self.kind(), "health_check"))
    }
}

/// A complete backend: the union of every capability trait.
pub trait ProviderBackend: Lifecycle + ImageManagement + HealthCheck {}

impl<T> ProviderBackend for T where T: Lifecycle + ImageManagement + HealthCheck {}

#[cfg(test)]
mod tests {
    use super::*;
    use virtfleet_core::{InstanceId, PortMappingId, ProviderId};
    use virtfleet_store::PortMappingStatus;

    struct Bare;

    #[async_trait]
    impl Connection for Bare {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Incus
        }
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) {}
        fn is_connected(&self) -> bool {
            true
        }
        async fn ensure_connection(&self) -> Result<()> {
            Ok(())
        }
        async fn execute_ssh_command(&self, _command: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    #[async_trait]
    impl Lifecycle for Bare {
        fn supported_instance_types(&self) -> Vec<InstanceKind> {
            vec![InstanceKind::Container]
        }
    }

    #[async_trait]
    impl ImageManagement for Bare {}

    #[async_trait]
    impl HealthCheck for Bare {}

    #[tokio::test]
    async fn missing_capabilities_return_typed_errors() {
        let backend: Arc<dyn ProviderBackend> = Arc::new(Bare);
        let err = backend.pull_image("debian/12").await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Unsupported {
                backend: "incus",
                operation: "pull_image"
            }
        ));
        assert!(backend.start_instance("web").await.is_err());
        assert!(backend.health_check(false).await.is_err());
    }

    #[test]
    fn spec_carries_instance_and_ports() {
        let mut instance = Instance::new(
            InstanceId::new(42),
            ProviderId::new(1),
            "web-42",
            InstanceKind::Container,
            "nginx:latest",
        );
        instance.resources.cpu = 2;
        let mapping = PortMapping {
            id: PortMappingId::generate(),
            instance_id: instance.id,
            provider_id: instance.provider_id,
            host_port: 10022,
            guest_port: 22,
            protocol: Protocol::Both,
            is_ssh: true,
            is_automatic: true,
            mapping_method: "native".into(),
            status: PortMappingStatus::Active,
            description: String::new(),
            ipv6_enabled: false,
            created_at: chrono::Utc::now(),
        };

        let spec = InstanceSpec::from_instance(&instance, &[mapping]);
        assert_eq!(spec.cpu, 2);
        assert_eq!(
            spec.ports,
            vec![PortSpec {
                host_port: 10022,
                guest_port: 22,
                protocol: Protocol::Both
            }]
        );
    }
}
