//! Request and response types for port mapping operations.

use serde::{Deserialize, Serialize};
use virtfleet_core::{InstanceId, PortMappingId, ProviderId};
use virtfleet_store::{PortMapping, PortMappingStatus, Protocol, Provider};

use crate::error::{PortMapError, Result};

/// Payload of a create-port-mapping task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMappingRequest {
    /// Instance to forward to.
    pub instance_id: InstanceId,
    /// Host port; absent or 0 allocates from the provider's range.
    #[serde(default)]
    pub host_port: Option<u32>,
    /// Port inside the instance.
    pub guest_port: u32,
    /// `tcp`, `udp`, or `both`; absent means `tcp`.
    #[serde(default)]
    pub protocol: Option<String>,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Also listen on IPv6.
    #[serde(default)]
    pub ipv6_enabled: bool,
}

/// Payload of a delete-port-mapping task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMappingDeletion {
    /// The mapping to remove.
    pub port_id: PortMappingId,
}

/// Fields to change on an existing mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMappingUpdate {
    /// New host port.
    #[serde(default)]
    pub host_port: Option<u32>,
    /// New guest port.
    #[serde(default)]
    pub guest_port: Option<u32>,
    /// New protocol.
    #[serde(default)]
    pub protocol: Option<String>,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
}

/// A validated create request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedMapping {
    /// `None` allocates from the range.
    pub host_port: Option<u16>,
    /// Guest port.
    pub guest_port: u16,
    /// Protocol.
    pub protocol: Protocol,
}

/// Guest ports must be 1-65535.
///
/// # Errors
///
/// Returns `PortMapError::Validation` for 0 or values above 65535.
pub fn validate_guest_port(port: u32) -> Result<u16> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| PortMapError::Validation(format!("guest port {port} outside 1-65535")))
}

/// Host ports must be 0-65535, 0 meaning "allocate".
///
/// # Errors
///
/// Returns `PortMapError::Validation` for values above 65535.
pub fn validate_host_port(port: u32) -> Result<Option<u16>> {
    let port = u16::try_from(port)
        .map_err(|_| PortMapError::Validation(format!("host port {port} outside 0-65535")))?;
    Ok((port != 0).then_some(port))
}

/// Protocol must be one of `tcp`, `udp`, `both`.
///
/// # Errors
///
/// Returns `PortMapError::Validation` for anything else.
pub fn validate_protocol(protocol: Option<&str>) -> Result<Protocol> {
    let raw = protocol.unwrap_or("tcp");
    Protocol::parse(raw)
        .ok_or_else(|| PortMapError::Validation(format!("unknown protocol {raw:?}")))
}

impl PortMappingRequest {
    /// Check ports and protocol.
    ///
    /// # Errors
    ///
    /// Returns `PortMapError::Validation` describing the first bad field.
    pub fn validate(&self) -> Result<ValidatedMapping> {
        Ok(ValidatedMapping {
            host_port: validate_host_port(self.host_port.unwrap_or(0))?,
            guest_port: validate_guest_port(self.guest_port)?,
            protocol: validate_protocol(self.protocol.as_deref())?,
        })
    }
}

/// A mapping as presented to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMappingView {
    /// Mapping ID.
    pub id: PortMappingId,
    /// Instance the port forwards to.
    pub instance_id: InstanceId,
    /// Provider holding the host port.
    pub provider_id: ProviderId,
    /// Protocol.
    pub protocol: Protocol,
    /// Host port.
    pub host_port: u16,
    /// Guest port.
    pub guest_port: u16,
    /// Address the provider is reached at.
    #[serde(rename = "hostIP")]
    pub host_ip: String,
    /// Address clients connect to.
    #[serde(rename = "publicIP")]
    pub public_ip: String,
    /// Backend state.
    pub status: PortMappingStatus,
    /// Method that configured it.
    pub mapping_method: String,
    /// Carries SSH.
    #[serde(rename = "isSSH")]
    pub is_ssh: bool,
    /// Created by default allocation rather than by request.
    pub is_automatic: bool,
    /// Free-form description.
    pub description: String,
}

impl PortMappingView {
    /// Present `mapping` with the addresses of `provider`.
    #[must_use]
    pub fn new(provider: &Provider, mapping: &PortMapping) -> Self {
        Self {
            id: mapping.id,
            instance_id: mapping.instance_id,
            provider_id: mapping.provider_id,
            protocol: mapping.protocol,
            host_port: mapping.host_port,
            guest_port: mapping.guest_port,
            host_ip: provider.endpoint_host().to_string(),
            public_ip: provider.public_ip().to_string(),
            status: mapping.status,
            mapping_method: mapping.mapping_method.clone(),
            is_ssh: mapping.is_ssh,
            is_automatic: mapping.is_automatic,
            description: mapping.description.clone(),
        }
    }
}
