//! The contract every port mapping method implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use virtfleet_provider::ProviderBackend;
use virtfleet_store::{Instance, PortMapping, Protocol, Provider};

use crate::error::Result;

/// The instance a mapping change applies to.
pub struct MappingTarget<'a> {
    /// Provider hosting the instance.
    pub provider: &'a Provider,
    /// The instance.
    pub instance: &'a Instance,
    /// Connected backend of the provider.
    pub backend: &'a dyn ProviderBackend,
    /// Every mapping the instance should have once the change is applied.
    pub desired: &'a [PortMapping],
}

/// A forward found on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedMapping {
    /// First host port.
    pub host_port: u16,
    /// Last host port; equal to `host_port` for single-port forwards.
    pub host_port_end: u16,
    /// Guest port, when the backend reports it.
    pub guest_port: Option<u16>,
    /// Protocol.
    pub protocol: Protocol,
    /// Backend name of the forward (device, unit, or binding).
    pub source: String,
}

/// How host ports reach an instance on one backend family.
#[async_trait]
pub trait PortMappingMethod: Send + Sync {
    /// Name recorded as the mapping's `mapping_method`.
    fn name(&self) -> &'static str;

    /// Returns false if any change requires recreating the instance.
    fn supports_dynamic_mapping(&self) -> bool;

    /// Configure `added` on the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the change.
    async fn create_port_mapping(&self, target: &MappingTarget<'_>, added: &[PortMapping]) -> Result<()>;

    /// Remove `removed` from the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the change.
    async fn delete_port_mapping(&self, target: &MappingTarget<'_>, removed: &[PortMapping]) -> Result<()>;

    /// Replace `old` with `new` on the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the change.
    async fn update_port_mapping(&self, target: &MappingTarget<'_>, old: &PortMapping, new: &PortMapping) -> Result<()> {
        self.delete_port_mapping(target, std::slice::from_ref(old)).await?;
        self.create_port_mapping(target, std::slice::from_ref(new)).await
    }

    /// Forwards currently configured on the backend for the instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    async fn list_port_mappings(&self, target: &MappingTarget<'_>) -> Result<Vec<ObservedMapping>>;
}

/// SSH mappings first, so a failure later in the batch leaves the instance
/// reachable.
#[must_use]
pub fn ssh_first(mappings: &[PortMapping]) -> Vec<PortMapping> {
    let (mut ordered, rest): (Vec<_>, Vec<_>) = mappings.iter().cloned().partition(|m| m.is_ssh);
    ordered.extend(rest);
    ordered
}
