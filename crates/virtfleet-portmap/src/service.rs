//! Port mapping service: allocation, backend configuration, and records.
//!
//! Host ports are reserved in the store first (allocation and record
//! insertion are one store transaction), then configured on the backend
//! through the provider's [`PortMappingMethod`]. A backend failure after a
//! successful reservation rolls the reservation back.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};
use virtfleet_core::{InstanceId, PortMappingId};
use virtfleet_provider::ProviderPool;
use virtfleet_store::{
    HostPortRequest, Instance, NewPortMapping, PortMapping, PortMappingStatus, Protocol, Provider,
    Store,
};

use crate::error::{PortMapError, Result};
use crate::method::{MappingTarget, ObservedMapping, PortMappingMethod};
use crate::registry::PortMappingRegistry;
use crate::types::{
    validate_guest_port, validate_host_port, validate_protocol, PortMappingRequest,
    PortMappingUpdate, PortMappingView,
};

/// Guest port of the default SSH mapping.
pub const SSH_GUEST_PORT: u16 = 22;

/// Manages the port mappings of instances.
pub struct PortMapper<S: Store> {
    store: Arc<S>,
    pool: Arc<ProviderPool>,
    methods: Arc<PortMappingRegistry>,
}

impl<S: Store> PortMapper<S> {
    /// Create a new port mapper.
    #[must_use]
    pub fn new(store: Arc<S>, pool: Arc<ProviderPool>, methods: Arc<PortMappingRegistry>) -> Self {
        Self {
            store,
            pool,
            methods,
        }
    }

    /// The mapping method serving `provider`.
    ///
    /// # Errors
    ///
    /// Returns `PortMapError::NoMethod` if no method is registered.
    pub fn method_for(&self, provider: &Provider) -> Result<Arc<dyn PortMappingMethod>> {
        self.methods.method_for(provider)
    }

    /// Returns true if mappings on `provider` change without recreating the
    /// instance.
    ///
    /// # Errors
    ///
    /// Returns `PortMapError::NoMethod` if no method is registered.
    pub fn supports_dynamic(&self, provider: &Provider) -> Result<bool> {
        Ok(self.method_for(provider)?.supports_dynamic_mapping())
    }

    fn load(&self, instance_id: InstanceId) -> Result<(Instance, Provider)> {
        let instance = self
            .store
            .get_instance(instance_id)?
            .ok_or(PortMapError::InstanceNotFound(instance_id))?;
        let provider = self
            .store
            .get_provider(instance.provider_id)?
            .ok_or(PortMapError::ProviderNotFound(instance.provider_id))?;
        Ok((instance, provider))
    }

    fn load_mapping(&self, mapping_id: &PortMappingId) -> Result<PortMapping> {
        self.store
            .get_port_mapping(mapping_id)?
            .ok_or(PortMapError::MappingNotFound(*mapping_id))
    }

    /// Drafts of the default mappings for a new instance.
    ///
    /// NAT networks get one SSH mapping (guest 22, both protocols, preferring
    /// the first port of the range) and up to `default_port_count - 1`
    /// one-to-one mappings drawn from the allocation cursor. Other networks
    /// get none.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider's reservations cannot be read.
    pub fn default_drafts(&self, provider: &Provider, instance: &Instance) -> Result<Vec<NewPortMapping>> {
        if !provider.network_type.uses_port_mappings() || provider.default_port_count == 0 {
            return Ok(Vec::new());
        }
        let method = self.method_for(provider)?.name().to_string();
        let mut taken: HashSet<(u16, Protocol)> = HashSet::new();
        for mapping in self.store.list_port_mappings_by_provider(provider.id)? {
            for &protocol in mapping.protocol.expand() {
                taken.insert((mapping.host_port, protocol));
            }
        }
        let is_free = |port: u16| {
            !taken.contains(&(port, Protocol::Tcp)) && !taken.contains(&(port, Protocol::Udp))
        };

        let mut drafts = Vec::new();
        let ssh_port = free_ports(provider, provider.port_range_start, 1, &is_free, None)
            .first()
            .copied()
            .unwrap_or(provider.port_range_start);
        let mut ssh = NewPortMapping::new(instance.id, HostPortRequest::PreferOrNext(ssh_port), SSH_GUEST_PORT)
            .with_protocol(Protocol::Both);
        ssh.is_ssh = true;
        ssh.is_automatic = true;
        ssh.mapping_method.clone_from(&method);
        ssh.description = "SSH".to_string();
        ssh.ipv6_enabled = provider.network_type.has_ipv6();
        drafts.push(ssh);

        let extra = usize::from(provider.default_port_count.saturating_sub(1));
        for port in free_ports(provider, provider.next_available_port, extra, &is_free, Some(ssh_port)) {
            let mut draft = NewPortMapping::new(instance.id, HostPortRequest::IfFree(port), port)
                .with_protocol(Protocol::Both);
            draft.is_automatic = true;
            draft.mapping_method.clone_from(&method);
            draft.ipv6_enabled = provider.network_type.has_ipv6();
            drafts.push(draft);
        }
        Ok(drafts)
    }

    /// Reserve the default mappings of a new instance and record its SSH port.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PortsExhausted` (wrapped) if the range is full.
    pub fn allocate_defaults(&self, provider: &Provider, instance: &Instance) -> Result<Vec<PortMapping>> {
        let drafts = self.default_drafts(provider, instance)?;
        if drafts.is_empty() {
            return Ok(Vec::new());
        }
        let created = self.store.insert_port_mappings(provider.id, &drafts)?;
        if let Some(ssh) = created.iter().find(|m| m.is_ssh) {
            let ssh_port = ssh.host_port;
            self.store
                .update_instance(instance.id, &mut |i| i.ssh_port = Some(ssh_port))?;
        }
        info!(
            instance_id = %instance.id,
            provider_id = %provider.id,
            count = created.len(),
            "Allocated default port mappings"
        );
        Ok(created)
    }

    /// Configure already reserved mappings of a freshly created instance.
    ///
    /// Engine-native methods published them at creation and are only marked
    /// active. On failure every mapping is marked failed.
    ///
    /// # Errors
    ///
    /// Returns the backend error if configuration fails.
    pub async fn apply(&self, provider: &Provider, instance: &Instance, mappings: &[PortMapping]) -> Result<()> {
        if mappings.is_empty() {
            return Ok(());
        }
        let method = self.method_for(provider)?;
        if method.supports_dynamic_mapping() {
            let backend = self.pool.connected(provider).await?;
            let target = MappingTarget {
                provider,
                instance,
                backend: backend.as_ref(),
                desired: mappings,
            };
            if let Err(e) = method.create_port_mapping(&target, mappings).await {
                self.mark(mappings, PortMappingStatus::Failed);
                return Err(e);
            }
        }
        self.mark(mappings, PortMappingStatus::Active);
        Ok(())
    }

    fn mark(&self, mappings: &[PortMapping], status: PortMappingStatus) {
        for mapping in mappings {
            if let Err(e) = self
                .store
                .update_port_mapping(&mapping.id, &mut |m| m.status = status)
            {
                warn!(mapping_id = %mapping.id, error = %e, "Failed to record mapping status");
            }
        }
    }

    /// Create a mapping on request.
    ///
    /// # Errors
    ///
    /// Returns `PortMapError::Validation` for bad input, a wrapped
    /// `StoreError::PortTaken`/`PortsExhausted` if the port cannot be
    /// reserved, or the backend error (after releasing the reservation).
    pub async fn create_mapping(&self, request: &PortMappingRequest) -> Result<PortMappingView> {
        let valid = request.validate()?;
        let (instance, provider) = self.load(request.instance_id)?;
        let method = self.method_for(&provider)?;

        let host_port = valid
            .host_port
            .map_or(HostPortRequest::Next, HostPortRequest::Exact);
        let mut draft = NewPortMapping::new(instance.id, host_port, valid.guest_port)
            .with_protocol(valid.protocol);
        draft.mapping_method = method.name().to_string();
        draft.description.clone_from(&request.description);
        draft.ipv6_enabled = request.ipv6_enabled;

        let created = self.store.insert_port_mappings(provider.id, &[draft])?;
        let Some(mapping) = created.into_iter().next() else {
            return Err(PortMapError::Validation("no mapping was reserved".to_string()));
        };

        let desired = self.store.list_port_mappings_by_instance(instance.id)?;
        let result: Result<()> = async {
            let backend = self.pool.connected(&provider).await?;
            let target = MappingTarget {
                provider: &provider,
                instance: &instance,
                backend: backend.as_ref(),
                desired: &desired,
            };
            method
                .create_port_mapping(&target, std::slice::from_ref(&mapping))
                .await
        }
        .await;

        if let Err(e) = result {
            warn!(mapping_id = %mapping.id, error = %e, "Backend rejected mapping, releasing reservation");
            if let Err(release) = self.store.delete_port_mapping(&mapping.id) {
                warn!(mapping_id = %mapping.id, error = %release, "Failed to release reservation");
            }
            return Err(e);
        }

        let active = self
            .store
            .update_port_mapping(&mapping.id, &mut |m| m.status = PortMappingStatus::Active)?;
        info!(
            mapping_id = %active.id,
            instance_id = %instance.id,
            host_port = active.host_port,
            guest_port = active.guest_port,
            protocol = active.protocol.as_str(),
            "Port mapping created"
        );
        Ok(PortMappingView::new(&provider, &active))
    }

    /// Change a mapping's ports, protocol, or description.
    ///
    /// The store record moves first; if the backend rejects the change the
    /// record is restored.
    ///
    /// # Errors
    ///
    /// Returns `PortMapError::Validation` for bad input, a wrapped
    /// `StoreError::PortTaken` for a reserved host port, or the backend error.
    pub async fn update_mapping(&self, mapping_id: &PortMappingId, update: &PortMappingUpdate) -> Result<PortMappingView> {
        let host_port = update
            .host_port
            .map(validate_host_port)
            .transpose()?
            .flatten();
        let guest_port = update.guest_port.map(validate_guest_port).transpose()?;
        let protocol = update
            .protocol
            .as_deref()
            .map(|p| validate_protocol(Some(p)))
            .transpose()?;

        let old = self.load_mapping(mapping_id)?;
        let (instance, provider) = self.load(old.instance_id)?;
        let method = self.method_for(&provider)?;

        let new = self.store.update_port_mapping(mapping_id, &mut |m| {
            if let Some(port) = host_port {
                m.host_port = port;
            }
            if let Some(port) = guest_port {
                m.guest_port = port;
            }
            if let Some(protocol) = protocol {
                m.protocol = protocol;
            }
            if let Some(description) = &update.description {
                m.description.clone_from(description);
            }
        })?;

        let forwarding_changed = new.host_port != old.host_port
            || new.guest_port != old.guest_port
            || new.protocol != old.protocol;
        if forwarding_changed {
            let desired = self.store.list_port_mappings_by_instance(instance.id)?;
            let result: Result<()> = async {
                let backend = self.pool.connected(&provider).await?;
                let target = MappingTarget {
                    provider: &provider,
                    instance: &instance,
                    backend: backend.as_ref(),
                    desired: &desired,
                };
                method.update_port_mapping(&target, &old, &new).await
            }
            .await;

            if let Err(e) = result {
                warn!(mapping_id = %mapping_id, error = %e, "Backend rejected update, restoring mapping");
                let restore = old.clone();
                if let Err(restore_err) = self.store.update_port_mapping(mapping_id, &mut |m| {
                    m.host_port = restore.host_port;
                    m.guest_port = restore.guest_port;
                    m.protocol = restore.protocol;
                    m.description.clone_from(&restore.description);
                }) {
                    warn!(mapping_id = %mapping_id, error = %restore_err, "Failed to restore mapping");
                }
                return Err(e);
            }
            info!(
                mapping_id = %mapping_id,
                host_port = new.host_port,
                guest_port = new.guest_port,
                "Port mapping updated"
            );
        }
        Ok(PortMappingView::new(&provider, &new))
    }

    /// Remove a mapping from the backend, then release it.
    ///
    /// # Errors
    ///
    /// Returns `PortMapError::MappingNotFound` or the backend error; the
    /// record is kept when the backend fails.
    pub async fn delete_mapping(&self, mapping_id: &PortMappingId) -> Result<PortMapping> {
        let mapping = self.load_mapping(mapping_id)?;
        let (instance, provider) = self.load(mapping.instance_id)?;
        let method = self.method_for(&provider)?;

        let desired: Vec<PortMapping> = self
            .store
            .list_port_mappings_by_instance(instance.id)?
            .into_iter()
            .filter(|m| m.id != mapping.id)
            .collect();
        let backend = self.pool.connected(&provider).await?;
        let target = MappingTarget {
            provider: &provider,
            instance: &instance,
            backend: backend.as_ref(),
            desired: &desired,
        };
        method
            .delete_port_mapping(&target, std::slice::from_ref(&mapping))
            .await?;

        let removed = self.store.delete_port_mapping(mapping_id)?;
        info!(mapping_id = %mapping_id, host_port = removed.host_port, "Port mapping deleted");
        Ok(removed)
    }

    /// Remove every forward of an instance from the backend before the
    /// instance itself is deleted. Records are left to the caller, which
    /// purges them with the instance.
    ///
    /// Engine-native forwards disappear with the container and are skipped.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn teardown(&self, provider: &Provider, instance: &Instance) -> Result<()> {
        let method = self.method_for(provider)?;
        if !method.supports_dynamic_mapping() {
            return Ok(());
        }
        let mappings = self.store.list_port_mappings_by_instance(instance.id)?;
        if mappings.is_empty() {
            return Ok(());
        }
        let backend = self.pool.connected(provider).await?;
        let target = MappingTarget {
            provider,
            instance,
            backend: backend.as_ref(),
            desired: &[],
        };
        method.delete_port_mapping(&target, &mappings).await
    }

    /// Stored mappings of an instance.
    ///
    /// # Errors
    ///
    /// Returns `PortMapError::InstanceNotFound` if the instance doesn't exist.
    pub fn list_mappings(&self, instance_id: InstanceId) -> Result<Vec<PortMappingView>> {
        let (_, provider) = self.load(instance_id)?;
        Ok(self
            .store
            .list_port_mappings_by_instance(instance_id)?
            .iter()
            .map(|m| PortMappingView::new(&provider, m))
            .collect())
    }

    /// Forwards actually configured on the backend for an instance.
    ///
    /// # Errors
    ///
    /// Returns `PortMapError::InstanceNotFound` or the backend error.
    pub async fn observed_mappings(&self, instance_id: InstanceId) -> Result<Vec<ObservedMapping>> {
        let (instance, provider) = self.load(instance_id)?;
        let method = self.method_for(&provider)?;
        let desired = self.store.list_port_mappings_by_instance(instance_id)?;
        let backend = self.pool.connected(&provider).await?;
        let target = MappingTarget {
            provider: &provider,
            instance: &instance,
            backend: backend.as_ref(),
            desired: &desired,
        };
        method.list_port_mappings(&target).await
    }
}

/// Up to `count` free ports of the provider's range, scanning from `from`
/// and wrapping to the range start.
fn free_ports(
    provider: &Provider,
    from: u16,
    count: usize,
    is_free: &dyn Fn(u16) -> bool,
    skip: Option<u16>,
) -> Vec<u16> {
    if count == 0 || provider.port_range_len() == 0 {
        return Vec::new();
    }
    let start = provider.port_range_start;
    let end = provider.port_range_end;
    let from = if provider.port_in_range(from) { from } else { start };

    (from..=end)
        .chain(start..from)
        .filter(|p| Some(*p) != skip && is_free(*p))
        .take(count)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use virtfleet_core::ProviderId;
    use virtfleet_provider::{BackendOptions, MockProvider, ProviderRegistry};
    use virtfleet_store::{InstanceKind, NetworkType, ProviderKind, RocksStore};

    struct Fixture {
        mapper: PortMapper<RocksStore>,
        store: Arc<RocksStore>,
        backend: Arc<MockProvider>,
        provider: Provider,
        instance: Instance,
        _dir: TempDir,
    }

    fn fixture(kind: ProviderKind) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());

        let mut provider = Provider::new(ProviderId::new(1), "edge-1", kind, "198.51.100.7");
        provider.port_range_start = 10000;
        provider.port_range_end = 10019;
        provider.next_available_port = 10000;
        provider.default_port_count = 4;
        store.put_provider(&provider).unwrap();

        let mut instance = Instance::new(InstanceId::new(42), provider.id, "web-42", InstanceKind::Container, "nginx:1.25");
        instance.private_ip = Some("10.0.3.42".into());
        store.put_instance(&instance).unwrap();

        let backend = Arc::new(MockProvider::new(kind));
        backend.insert_instance("web-42", InstanceKind::Container, "running");
        let pool = Arc::new(ProviderPool::new(Arc::new(ProviderRegistry::new(BackendOptions::default()))));
        pool.insert(provider.id, backend.clone());

        let mapper = PortMapper::new(Arc::clone(&store), pool, Arc::new(PortMappingRegistry::with_builtin()));
        Fixture {
            mapper,
            store,
            backend,
            provider,
            instance,
            _dir: dir,
        }
    }

    #[test]
    fn defaults_put_ssh_at_range_start() {
        let fx = fixture(ProviderKind::Lxd);
        let created = fx.mapper.allocate_defaults(&fx.provider, &fx.instance).unwrap();

        assert_eq!(created.len(), 4);
        let ssh = &created[0];
        assert!(ssh.is_ssh);
        assert_eq!((ssh.host_port, ssh.guest_port, ssh.protocol), (10000, 22, Protocol::Both));
        for mapping in &created[1..] {
            assert_eq!(mapping.host_port, mapping.guest_port);
            assert!(fx.provider.port_in_range(mapping.host_port));
            assert_eq!(mapping.mapping_method, "proxy_device");
        }

        let instance = fx.store.get_instance(fx.instance.id).unwrap().unwrap();
        assert_eq!(instance.ssh_port, Some(10000));
    }

    #[test]
    fn dedicated_networks_get_no_defaults() {
        let fx = fixture(ProviderKind::Lxd);
        let mut provider = fx.provider.clone();
        provider.network_type = NetworkType::DedicatedIpv4;
        assert!(fx.mapper.default_drafts(&provider, &fx.instance).unwrap().is_empty());
    }

    #[test]
    fn free_port_scan_wraps_and_skips() {
        let mut provider = Provider::new(ProviderId::new(1), "p", ProviderKind::Lxd, "h");
        provider.port_range_start = 100;
        provider.port_range_end = 104;
        let taken = [101u16, 103];
        let is_free = |p: u16| !taken.contains(&p);
        assert_eq!(free_ports(&provider, 103, 3, &is_free, Some(100)), vec![104, 102]);
        assert_eq!(free_ports(&provider, 5000, 1, &is_free, None), vec![100]);
    }

    #[tokio::test]
    async fn create_and_delete_on_proxy_devices() {
        let fx = fixture(ProviderKind::Incus);
        let request = PortMappingRequest {
            instance_id: fx.instance.id,
            host_port: Some(10010),
            guest_port: 8080,
            protocol: Some("tcp".into()),
            description: "app".into(),
            ipv6_enabled: false,
        };

        let view = fx.mapper.create_mapping(&request).await.unwrap();
        assert_eq!(view.host_port, 10010);
        assert_eq!(view.status, PortMappingStatus::Active);
        assert_eq!(view.public_ip, "198.51.100.7");
        let adds = fx.backend.calls_of("execute_ssh_command incus config device add");
        assert_eq!(adds.len(), 1);
        assert!(adds[0].contains("proxy-tcp-10010"));

        fx.mapper.delete_mapping(&view.id).await.unwrap();
        assert!(fx.store.get_port_mapping(&view.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn backend_failure_releases_reservation() {
        let fx = fixture(ProviderKind::Lxd);
        fx.backend.fail("execute_ssh_command", "Error: Instance is not running");
        let request = PortMappingRequest {
            instance_id: fx.instance.id,
            host_port: None,
            guest_port: 80,
            protocol: None,
            description: String::new(),
            ipv6_enabled: false,
        };

        assert!(fx.mapper.create_mapping(&request).await.is_err());
        assert!(fx.store.list_port_mappings_by_instance(fx.instance.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn docker_guest_port_change_recreates_with_updated_set() {
        let fx = fixture(ProviderKind::Docker);
        let created = fx.mapper.allocate_defaults(&fx.provider, &fx.instance).unwrap();
        fx.mapper.apply(&fx.provider, &fx.instance, &created).await.unwrap();
        assert!(fx.backend.calls_of("create_instance").is_empty());

        let target = created[1].clone();
        let update = PortMappingUpdate {
            guest_port: Some(8080),
            ..PortMappingUpdate::default()
        };
        fx.mapper.update_mapping(&target.id, &update).await.unwrap();

        assert_eq!(fx.backend.calls_of("delete_instance"), vec!["delete_instance web-42"]);
        let specs = fx.backend.created_specs();
        assert_eq!(specs.len(), 1);
        let ports: HashSet<(u16, u16)> = specs[0].ports.iter().map(|p| (p.host_port, p.guest_port)).collect();
        assert!(ports.contains(&(target.host_port, 8080)));
        assert!(!ports.contains(&(target.host_port, target.guest_port)));
        for other in created.iter().filter(|m| m.id != target.id) {
            assert!(ports.contains(&(other.host_port, other.guest_port)));
        }
        assert_eq!(ports.len(), created.len());
    }

    #[tokio::test]
    async fn failed_update_restores_record() {
        let fx = fixture(ProviderKind::Docker);
        let created = fx.mapper.allocate_defaults(&fx.provider, &fx.instance).unwrap();
        fx.backend.fail("create_instance", "Error: image not found");

        let update = PortMappingUpdate {
            host_port: Some(10015),
            ..PortMappingUpdate::default()
        };
        assert!(fx.mapper.update_mapping(&created[1].id, &update).await.is_err());
        let stored = fx.store.get_port_mapping(&created[1].id).unwrap().unwrap();
        assert_eq!(stored.host_port, created[1].host_port);
    }
}
