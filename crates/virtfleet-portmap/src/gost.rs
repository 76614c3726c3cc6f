//! Relay tunnels through `gost`, one systemd unit per forwarded port.
//!
//! Used for Proxmox guests, whose hosts have no per-guest forwarding
//! primitive. Each unit runs `gost -L=<proto>://:<host>/<guest-ip>:<guest>`
//! and is enabled so the forward survives host reboots.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use virtfleet_store::{PortMapping, Protocol, Provider, ProviderKind};

use crate::error::{PortMapError, Result};
use crate::method::{ssh_first, MappingTarget, ObservedMapping, PortMappingMethod};
use crate::registry::PortMappingRegistry;

const UNIT_PREFIX: &str = "virtfleet-gost-";
const UNIT_DIR: &str = "/etc/systemd/system";
const GOST_BINARY: &str = "/usr/local/bin/gost";

/// Register the tunnel method for Proxmox.
pub fn register(registry: &mut PortMappingRegistry) {
    registry.register(
        ProviderKind::Proxmox,
        Arc::new(|_: &Provider| Arc::new(GostTunnel) as Arc<dyn PortMappingMethod>),
    );
}

/// Unit name of one forwarded port and protocol.
#[must_use]
pub fn unit_name(protocol: Protocol, host_port: u16) -> String {
    format!("{UNIT_PREFIX}{}-{host_port}.service", protocol.as_str())
}

fn parse_unit_name(unit: &str) -> Option<(Protocol, u16)> {
    let rest = unit.strip_prefix(UNIT_PREFIX)?.strip_suffix(".service")?;
    let (proto, port) = rest.split_once('-')?;
    let protocol = match proto {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        _ => return None,
    };
    Some((protocol, port.parse().ok()?))
}

fn unit_file(instance: &str, guest_ip: &str, mapping: &PortMapping, protocol: Protocol) -> String {
    let proto = protocol.as_str();
    format!(
        "[Unit]\n\
         Description=virtfleet {proto} {host} -> {instance}:{guest}\n\
         After=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart={GOST_BINARY} -L={proto}://:{host}/{guest_ip}:{guest}\n\
         Restart=always\n\
         RestartSec=3\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        host = mapping.host_port,
        guest = mapping.guest_port,
    )
}

/// Tunnel method backed by `gost` relays.
pub struct GostTunnel;

impl GostTunnel {
    async fn guest_ip(target: &MappingTarget<'_>) -> Result<String> {
        if let Some(ip) = target.instance.private_ip.as_deref().filter(|ip| !ip.is_empty()) {
            return Ok(ip.to_string());
        }
        target
            .backend
            .get_instance(&target.instance.name)
            .await?
            .ipv4
            .ok_or_else(|| {
                PortMapError::Validation(format!(
                    "instance {} has no IPv4 address to forward to",
                    target.instance.name
                ))
            })
    }

    async fn install(target: &MappingTarget<'_>, guest_ip: &str, mapping: &PortMapping) -> Result<()> {
        for &protocol in mapping.protocol.expand() {
            let unit = unit_name(protocol, mapping.host_port);
            let content = unit_file(&target.instance.name, guest_ip, mapping, protocol);
            let command = format!(
                "cat > {UNIT_DIR}/{unit} <<'UNIT'\n{content}UNIT\nsystemctl daemon-reload && systemctl enable --now {unit}"
            );
            target.backend.execute_ssh_command(&command).await?;
        }
        Ok(())
    }

    async fn remove(target: &MappingTarget<'_>, mapping: &PortMapping) -> Result<()> {
        for &protocol in mapping.protocol.expand() {
            let unit = unit_name(protocol, mapping.host_port);
            let command = format!(
                "systemctl disable --now {unit} 2>/dev/null; rm -f {UNIT_DIR}/{unit} && systemctl daemon-reload"
            );
            target.backend.execute_ssh_command(&command).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PortMappingMethod for GostTunnel {
    fn name(&self) -> &'static str {
        "gost"
    }

    fn supports_dynamic_mapping(&self) -> bool {
        true
    }

    async fn create_port_mapping(&self, target: &MappingTarget<'_>, added: &[PortMapping]) -> Result<()> {
        let guest_ip = Self::guest_ip(target).await?;
        for mapping in ssh_first(added) {
            Self::install(target, &guest_ip, &mapping).await?;
        }
        info!(instance = %target.instance.name, count = added.len(), "Tunnels installed");
        Ok(())
    }

    async fn delete_port_mapping(&self, target: &MappingTarget<'_>, removed: &[PortMapping]) -> Result<()> {
        for mapping in removed {
            if let Err(e) = Self::remove(target, mapping).await {
                if e.kind().is_retriable() {
                    return Err(e);
                }
                warn!(host_port = mapping.host_port, error = %e, "Failed to remove tunnel unit");
            }
        }
        Ok(())
    }

    async fn list_port_mappings(&self, target: &MappingTarget<'_>) -> Result<Vec<ObservedMapping>> {
        let output = target
            .backend
            .execute_ssh_command(&format!(
                "systemctl list-units --all --plain --no-legend '{UNIT_PREFIX}*'"
            ))
            .await?;
        Ok(output
            .lines()
            .filter_map(|line| {
                let unit = line.split_whitespace().next()?;
                let (protocol, port) = parse_unit_name(unit)?;
                Some(ObservedMapping {
                    host_port: port,
                    host_port_end: port,
                    guest_port: None,
                    protocol,
                    source: unit.to_string(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use virtfleet_core::{InstanceId, PortMappingId, ProviderId};
    use virtfleet_provider::MockProvider;
    use virtfleet_store::{Instance, InstanceKind, PortMappingStatus};

    fn mapping(host: u16, guest: u16, protocol: Protocol, ssh: bool) -> PortMapping {
        PortMapping {
            id: PortMappingId::generate(),
            instance_id: InstanceId::new(7),
            provider_id: ProviderId::new(3),
            host_port: host,
            guest_port: guest,
            protocol,
            is_ssh: ssh,
            is_automatic: false,
            mapping_method: "gost".into(),
            status: PortMappingStatus::Pending,
            description: String::new(),
            ipv6_enabled: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn unit_names_round_trip() {
        let unit = unit_name(Protocol::Udp, 10053);
        assert_eq!(unit, "virtfleet-gost-udp-10053.service");
        assert_eq!(parse_unit_name(&unit), Some((Protocol::Udp, 10053)));
        assert_eq!(parse_unit_name("sshd.service"), None);
    }

    #[tokio::test]
    async fn ssh_tunnel_installed_first() {
        let backend = MockProvider::new(ProviderKind::Proxmox);
        let provider = Provider::new(ProviderId::new(3), "pve", ProviderKind::Proxmox, "192.0.2.30");
        let mut instance = Instance::new(InstanceId::new(7), provider.id, "vm-7", InstanceKind::Vm, "debian-12");
        instance.private_ip = Some("10.10.0.7".into());
        let added = vec![
            mapping(10080, 80, Protocol::Tcp, false),
            mapping(10022, 22, Protocol::Both, true),
        ];
        let target = MappingTarget {
            provider: &provider,
            instance: &instance,
            backend: &backend,
            desired: &added,
        };

        GostTunnel.create_port_mapping(&target, &added).await.unwrap();

        let commands = backend.calls_of("execute_ssh_command");
        assert_eq!(commands.len(), 3);
        assert!(commands[0].contains("virtfleet-gost-tcp-10022.service"));
        assert!(commands[0].contains("-L=tcp://:10022/10.10.0.7:22"));
        assert!(commands[1].contains("virtfleet-gost-udp-10022.service"));
        assert!(commands[2].contains("-L=tcp://:10080/10.10.0.7:80"));
    }

    #[tokio::test]
    async fn missing_guest_address_is_rejected() {
        let backend = MockProvider::new(ProviderKind::Proxmox);
        backend.insert_instance("vm-7", InstanceKind::Vm, "running");
        let provider = Provider::new(ProviderId::new(3), "pve", ProviderKind::Proxmox, "192.0.2.30");
        let instance = Instance::new(InstanceId::new(7), provider.id, "vm-7", InstanceKind::Vm, "debian-12");
        let added = vec![mapping(10080, 80, Protocol::Tcp, false)];
        let target = MappingTarget {
            provider: &provider,
            instance: &instance,
            backend: &backend,
            desired: &added,
        };

        let err = GostTunnel.create_port_mapping(&target, &added).await.unwrap_err();
        assert!(matches!(err, PortMapError::Validation(_)));
        assert!(backend.calls_of("execute_ssh_command").is_empty());
    }
}
