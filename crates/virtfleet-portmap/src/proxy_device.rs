//! Proxy devices on LXD and Incus instances.
//!
//! Each forward is a `proxy` device attached to the instance. Adjacent host
//! ports of one protocol whose guest ports are also adjacent share a single
//! range device, so an instance with a block of one-to-one mappings carries
//! one device per block instead of one per port.
//!
//! Every change reconciles the instance's `proxy-*` devices against the
//! desired mapping set: stale devices are removed, missing ones added, and
//! untouched devices (SSH in particular) are left alone.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use virtfleet_provider::{shell_quote, CliFlavor};
use virtfleet_store::{PortMapping, Protocol, Provider};

use crate::error::{PortMapError, Result};
use crate::method::{MappingTarget, ObservedMapping, PortMappingMethod};
use crate::registry::PortMappingRegistry;

/// Prefix of every device this method manages.
const DEVICE_PREFIX: &str = "proxy-";

/// Register the proxy-device method for LXD and Incus.
pub fn register(registry: &mut PortMappingRegistry) {
    for flavor in [CliFlavor::Lxd, CliFlavor::Incus] {
        registry.register(
            flavor.kind(),
            Arc::new(move |provider: &Provider| {
                Arc::new(ProxyDevice::new(flavor, provider.network_type.has_ipv6()))
                    as Arc<dyn PortMappingMethod>
            }),
        );
    }
}

/// One proxy device covering a contiguous block of ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Single protocol: `tcp` or `udp`.
    pub protocol: Protocol,
    /// First host port.
    pub host_start: u16,
    /// Last host port.
    pub host_end: u16,
    /// First guest port.
    pub guest_start: u16,
    /// Last guest port.
    pub guest_end: u16,
    /// Carries an SSH mapping; never merged with other ports.
    pub ssh: bool,
    /// Listens on IPv6 instead of IPv4.
    pub ipv6: bool,
}

impl DeviceSpec {
    /// Device name: `proxy-<proto>-<host>` or `proxy-<proto>-<start>-<end>`,
    /// with `-v6` appended for IPv6 listeners.
    #[must_use]
    pub fn name(&self) -> String {
        let ports = if self.host_start == self.host_end {
            self.host_start.to_string()
        } else {
            format!("{}-{}", self.host_start, self.host_end)
        };
        let suffix = if self.ipv6 { "-v6" } else { "" };
        format!("{DEVICE_PREFIX}{}-{ports}{suffix}", self.protocol.as_str())
    }

    fn port_arg(start: u16, end: u16) -> String {
        if start == end {
            start.to_string()
        } else {
            format!("{start}-{end}")
        }
    }

    /// `device add` arguments after the device name.
    #[must_use]
    pub fn arguments(&self) -> String {
        let proto = self.protocol.as_str();
        let listen = if self.ipv6 { "[::]" } else { "0.0.0.0" };
        format!(
            "proxy listen={proto}:{listen}:{} connect={proto}:127.0.0.1:{}",
            Self::port_arg(self.host_start, self.host_end),
            Self::port_arg(self.guest_start, self.guest_end),
        )
    }

    fn extends(&self, protocol: Protocol, host: u16, guest: u16, ssh: bool, ipv6: bool) -> bool {
        !self.ssh
            && !ssh
            && self.protocol == protocol
            && self.ipv6 == ipv6
            && u32::from(self.host_end) + 1 == u32::from(host)
            && u32::from(self.guest_end) + 1 == u32::from(guest)
    }
}

/// Group mappings into devices, SSH devices first.
///
/// `both` expands into a tcp and a udp device. IPv6 devices are produced only
/// when `with_ipv6` is set and the mapping asks for it.
#[must_use]
pub fn coalesce(mappings: &[PortMapping], with_ipv6: bool) -> Vec<DeviceSpec> {
    let mut entries: Vec<(bool, bool, Protocol, u16, u16)> = Vec::new();
    for mapping in mappings {
        for &protocol in mapping.protocol.expand() {
            entries.push((!mapping.is_ssh, false, protocol, mapping.host_port, mapping.guest_port));
            if with_ipv6 && mapping.ipv6_enabled {
                entries.push((!mapping.is_ssh, true, protocol, mapping.host_port, mapping.guest_port));
            }
        }
    }
    entries.sort_unstable();
    entries.dedup();

    let mut devices: Vec<DeviceSpec> = Vec::new();
    for (not_ssh, ipv6, protocol, host, guest) in entries {
        let ssh = !not_ssh;
        match devices.last_mut() {
            Some(last) if last.extends(protocol, host, guest, ssh, ipv6) => {
                last.host_end = host;
                last.guest_end = guest;
            }
            _ => devices.push(DeviceSpec {
                protocol,
                host_start: host,
                host_end: host,
                guest_start: guest,
                guest_end: guest,
                ssh,
                ipv6,
            }),
        }
    }
    devices
}

/// Parse a managed device name back into its protocol and host port range.
#[must_use]
pub fn parse_device_name(name: &str) -> Option<(Protocol, u16, u16)> {
    let rest = name.strip_prefix(DEVICE_PREFIX)?;
    let rest = rest.strip_suffix("-v6").unwrap_or(rest);
    let mut parts = rest.split('-');
    let protocol = match parts.next()? {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        _ => return None,
    };
    let start: u16 = parts.next()?.parse().ok()?;
    let end: u16 = match parts.next() {
        Some(end) => end.parse().ok()?,
        None => start,
    };
    if parts.next().is_some() || end < start {
        return None;
    }
    Some((protocol, start, end))
}

/// Proxy devices managed through the `lxc` or `incus` CLI.
pub struct ProxyDevice {
    flavor: CliFlavor,
    ipv6: bool,
}

impl ProxyDevice {
    /// Create the method for a CLI flavor.
    #[must_use]
    pub const fn new(flavor: CliFlavor, ipv6: bool) -> Self {
        Self { flavor, ipv6 }
    }

    async fn managed_devices(&self, target: &MappingTarget<'_>) -> Result<Vec<String>> {
        let command = format!(
            "{} config device list {}",
            self.flavor.binary(),
            shell_quote(&target.instance.name)
        );
        let output = target.backend.execute_ssh_command(&command).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| parse_device_name(line).is_some())
            .map(ToString::to_string)
            .collect())
    }

    async fn reconcile(&self, target: &MappingTarget<'_>) -> Result<()> {
        let cli = self.flavor.binary();
        let instance = shell_quote(&target.instance.name);
        let desired = coalesce(target.desired, self.ipv6);
        let wanted: HashSet<String> = desired.iter().map(DeviceSpec::name).collect();
        let existing = self.managed_devices(target).await?;

        // Stale range devices may overlap their replacements, so removals go first.
        for stale in existing.iter().filter(|name| !wanted.contains(*name)) {
            debug!(instance = %target.instance.name, device = %stale, "Removing proxy device");
            target
                .backend
                .execute_ssh_command(&format!("{cli} config device remove {instance} {stale}"))
                .await?;
        }

        let present: HashSet<&String> = existing.iter().collect();
        for device in desired.iter().filter(|d| !present.contains(&d.name())) {
            debug!(instance = %target.instance.name, device = %device.name(), "Adding proxy device");
            target
                .backend
                .execute_ssh_command(&format!(
                    "{cli} config device add {instance} {} {}",
                    device.name(),
                    device.arguments()
                ))
                .await?;
        }

        info!(
            instance = %target.instance.name,
            devices = desired.len(),
            "Proxy devices reconciled"
        );
        Ok(())
    }
}

#[async_trait]
impl PortMappingMethod for ProxyDevice {
    fn name(&self) -> &'static str {
        "proxy_device"
    }

    fn supports_dynamic_mapping(&self) -> bool {
        true
    }

    async fn create_port_mapping(&self, target: &MappingTarget<'_>, _added: &[PortMapping]) -> Result<()> {
        self.reconcile(target).await
    }

    async fn delete_port_mapping(&self, target: &MappingTarget<'_>, _removed: &[PortMapping]) -> Result<()> {
        self.reconcile(target).await
    }

    async fn update_port_mapping(&self, target: &MappingTarget<'_>, _old: &PortMapping, _new: &PortMapping) -> Result<()> {
        self.reconcile(target).await
    }

    async fn list_port_mappings(&self, target: &MappingTarget<'_>) -> Result<Vec<ObservedMapping>> {
        let devices = self.managed_devices(target).await?;
        devices
            .into_iter()
            .map(|name| {
                let (protocol, start, end) = parse_device_name(&name)
                    .ok_or_else(|| PortMapError::Validation(format!("unparsable device {name}")))?;
                Ok(ObservedMapping {
                    host_port: start,
                    host_port_end: end,
                    guest_port: None,
                    protocol,
                    source: name,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use virtfleet_core::{InstanceId, PortMappingId, ProviderId};
    use virtfleet_provider::MockProvider;
    use virtfleet_store::{Instance, InstanceKind, PortMappingStatus, ProviderKind};

    fn mapping(host: u16, guest: u16, protocol: Protocol, ssh: bool) -> PortMapping {
        PortMapping {
            id: PortMappingId::generate(),
            instance_id: InstanceId::new(42),
            provider_id: ProviderId::new(1),
            host_port: host,
            guest_port: guest,
            protocol,
            is_ssh: ssh,
            is_automatic: true,
            mapping_method: "proxy_device".into(),
            status: PortMappingStatus::Active,
            description: String::new(),
            ipv6_enabled: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn adjacent_ports_share_a_device() {
        let mappings = vec![
            mapping(10001, 10001, Protocol::Tcp, false),
            mapping(10002, 10002, Protocol::Tcp, false),
            mapping(10003, 10003, Protocol::Tcp, false),
            mapping(10005, 10005, Protocol::Tcp, false),
            mapping(10004, 10004, Protocol::Udp, false),
        ];
        let devices = coalesce(&mappings, false);
        let names: Vec<String> = devices.iter().map(DeviceSpec::name).collect();
        assert_eq!(names, vec!["proxy-tcp-10001-10003", "proxy-tcp-10005", "proxy-udp-10004"]);
        assert_eq!(
            devices[0].arguments(),
            "proxy listen=tcp:0.0.0.0:10001-10003 connect=tcp:127.0.0.1:10001-10003"
        );
    }

    #[test]
    fn ssh_stays_separate_and_first() {
        let mappings = vec![
            mapping(10001, 10001, Protocol::Both, false),
            mapping(10000, 22, Protocol::Both, true),
        ];
        let devices = coalesce(&mappings, false);
        assert_eq!(devices.len(), 4);
        assert!(devices[0].ssh && devices[1].ssh);
        assert_eq!(devices[0].name(), "proxy-tcp-10000");
        assert_eq!(devices[1].name(), "proxy-udp-10000");
    }

    #[test]
    fn non_contiguous_guests_do_not_merge() {
        let mappings = vec![
            mapping(10001, 80, Protocol::Tcp, false),
            mapping(10002, 443, Protocol::Tcp, false),
        ];
        assert_eq!(coalesce(&mappings, false).len(), 2);
    }

    #[test]
    fn device_names_round_trip() {
        assert_eq!(parse_device_name("proxy-tcp-10001-10003"), Some((Protocol::Tcp, 10001, 10003)));
        assert_eq!(parse_device_name("proxy-udp-10004-v6"), Some((Protocol::Udp, 10004, 10004)));
        assert_eq!(parse_device_name("eth0"), None);
        assert_eq!(parse_device_name("proxy-tcp-20-10"), None);
    }

    #[tokio::test]
    async fn reconcile_replaces_stale_range() {
        let backend = MockProvider::new(ProviderKind::Lxd);
        backend.respond_ssh("config device list", "eth0\nroot\nproxy-tcp-10000\nproxy-tcp-10001-10002\n");
        let provider = Provider::new(ProviderId::new(1), "lxd", ProviderKind::Lxd, "198.51.100.4");
        let instance = Instance::new(InstanceId::new(42), provider.id, "ct-42", InstanceKind::Container, "debian/12");
        let desired = vec![
            mapping(10000, 22, Protocol::Tcp, true),
            mapping(10001, 10001, Protocol::Tcp, false),
            mapping(10002, 10002, Protocol::Tcp, false),
            mapping(10003, 10003, Protocol::Tcp, false),
        ];
        let target = MappingTarget {
            provider: &provider,
            instance: &instance,
            backend: &backend,
            desired: &desired,
        };

        let method = ProxyDevice::new(CliFlavor::Lxd, false);
        method.create_port_mapping(&target, &desired[3..]).await.unwrap();

        let commands: Vec<String> = backend.calls_of("execute_ssh_command");
        assert_eq!(commands.len(), 3);
        assert!(commands[1].ends_with("lxc config device remove ct-42 proxy-tcp-10001-10002"));
        assert!(commands[2].contains("lxc config device add ct-42 proxy-tcp-10001-10003 proxy"));
        assert!(commands.iter().all(|c| !c.ends_with("proxy-tcp-10000")));
    }
}
