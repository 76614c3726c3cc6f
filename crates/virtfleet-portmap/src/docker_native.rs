//! Engine-native port publishing for Docker containers.
//!
//! Docker fixes published ports at `docker run`; there is no live remap. Any
//! change removes the container and runs it again from the same image and
//! resources with the stored mapping set, which the caller has already
//! updated to the desired state.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use virtfleet_provider::{shell_quote, InstanceSpec};
use virtfleet_store::{PortMapping, Protocol, Provider, ProviderKind};

use crate::error::Result;
use crate::method::{MappingTarget, ObservedMapping, PortMappingMethod};
use crate::registry::PortMappingRegistry;

/// Register the native method for Docker.
pub fn register(registry: &mut PortMappingRegistry) {
    registry.register(
        ProviderKind::Docker,
        Arc::new(|_: &Provider| Arc::new(DockerNative) as Arc<dyn PortMappingMethod>),
    );
}

/// Ports published by the container engine.
pub struct DockerNative;

impl DockerNative {
    async fn recreate(target: &MappingTarget<'_>) -> Result<()> {
        let spec = InstanceSpec::from_instance(target.instance, target.desired);
        warn!(
            instance = %target.instance.name,
            ports = spec.ports.len(),
            "Recreating container to change published ports"
        );
        target.backend.delete_instance(&target.instance.name).await?;
        target.backend.create_instance(&spec).await?;
        info!(instance = %target.instance.name, "Container recreated with new port set");
        Ok(())
    }
}

/// Parse `docker port` output: `80/tcp -> 0.0.0.0:10080`.
#[must_use]
pub fn parse_port_output(output: &str) -> Vec<ObservedMapping> {
    let mut observed: Vec<ObservedMapping> = Vec::new();
    for line in output.lines() {
        let Some((inner, outer)) = line.split_once("->") else {
            continue;
        };
        let Some((guest, proto)) = inner.trim().split_once('/') else {
            continue;
        };
        let protocol = match proto {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            _ => continue,
        };
        let Some(host) = outer
            .trim()
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
        else {
            continue;
        };
        let entry = ObservedMapping {
            host_port: host,
            host_port_end: host,
            guest_port: guest.parse().ok(),
            protocol,
            source: line.trim().to_string(),
        };
        // IPv4 and IPv6 bindings of one port are a single forward.
        if !observed
            .iter()
            .any(|o| o.host_port == host && o.protocol == protocol)
        {
            observed.push(entry);
        }
    }
    observed
}

#[async_trait]
impl PortMappingMethod for DockerNative {
    fn name(&self) -> &'static str {
        "native"
    }

    fn supports_dynamic_mapping(&self) -> bool {
        false
    }

    async fn create_port_mapping(&self, target: &MappingTarget<'_>, _added: &[PortMapping]) -> Result<()> {
        Self::recreate(target).await
    }

    async fn delete_port_mapping(&self, target: &MappingTarget<'_>, _removed: &[PortMapping]) -> Result<()> {
        Self::recreate(target).await
    }

    async fn update_port_mapping(&self, target: &MappingTarget<'_>, _old: &PortMapping, _new: &PortMapping) -> Result<()> {
        Self::recreate(target).await
    }

    async fn list_port_mappings(&self, target: &MappingTarget<'_>) -> Result<Vec<ObservedMapping>> {
        let output = target
            .backend
            .execute_ssh_command(&format!("docker port {}", shell_quote(&target.instance.name)))
            .await?;
        Ok(parse_port_output(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_output_collapses_dual_stack_bindings() {
        let output = "22/tcp -> 0.0.0.0:10000\n22/tcp -> [::]:10000\n53/udp -> 0.0.0.0:10053\n";
        let observed = parse_port_output(output);
        assert_eq!(observed.len(), 2);
        assert_eq!(observed[0].guest_port, Some(22));
        assert_eq!(observed[0].host_port, 10000);
        assert_eq!(observed[1].protocol, Protocol::Udp);
    }
}
