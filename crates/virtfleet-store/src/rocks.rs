//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.
//! All writes are serialized through one store-level lock so that
//! read-modify-write sequences (port cursor, usage counters, task
//! transitions) stay consistent without a transaction database.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use virtfleet_core::{InstanceId, PortMappingId, ProviderId, TaskId};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{
    HostPortRequest, Instance, NewPortMapping, PortMapping, PortMappingStatus, Protocol,
    Provider, Task, TaskStatus, UsageDelta,
};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_value<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn exists(&self, cf_name: &str, key: &[u8]) -> Result<bool> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_pinned_cf(&cf, key)
            .map(|v| v.is_some())
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Collect the keys of an index under `prefix`.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut found = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;

            // Stop if we're past the prefix
            if !key.starts_with(prefix) {
                break;
            }
            found.push(key);
        }
        Ok(found)
    }

    fn scan_all<T: serde::de::DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            values.push(Self::deserialize(&value)?);
        }
        Ok(values)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn load_provider(&self, provider_id: ProviderId) -> Result<Provider> {
        self.get_value(cf::PROVIDERS, &keys::provider_key(provider_id))?
            .ok_or(StoreError::NotFound)
    }

    fn stage_provider(&self, batch: &mut WriteBatch, provider: &Provider) -> Result<()> {
        let cf_providers = self.cf(cf::PROVIDERS)?;
        batch.put_cf(
            &cf_providers,
            keys::provider_key(provider.id),
            Self::serialize(provider)?,
        );
        Ok(())
    }

    fn stage_instance(&self, batch: &mut WriteBatch, instance: &Instance) -> Result<()> {
        let cf_instances = self.cf(cf::INSTANCES)?;
        let cf_by_provider = self.cf(cf::INSTANCES_BY_PROVIDER)?;
        batch.put_cf(
            &cf_instances,
            keys::instance_key(instance.id),
            Self::serialize(instance)?,
        );
        batch.put_cf(
            &cf_by_provider,
            keys::provider_instance_key(instance.provider_id, instance.id),
            b"",
        );
        Ok(())
    }

    /// Stage a task write, moving its status index entry if the status changed.
    fn stage_task(
        &self,
        batch: &mut WriteBatch,
        task: &Task,
        old_status: Option<TaskStatus>,
    ) -> Result<()> {
        let cf_tasks = self.cf(cf::TASKS)?;
        let cf_by_status = self.cf(cf::TASKS_BY_STATUS)?;
        let cf_by_provider = self.cf(cf::TASKS_BY_PROVIDER)?;

        batch.put_cf(&cf_tasks, keys::task_key(&task.id), Self::serialize(task)?);

        if let Some(old) = old_status {
            if old != task.status {
                batch.delete_cf(&cf_by_status, keys::status_task_key(old.as_u8(), &task.id));
            }
        }
        batch.put_cf(
            &cf_by_status,
            keys::status_task_key(task.status.as_u8(), &task.id),
            b"",
        );
        batch.put_cf(
            &cf_by_provider,
            keys::provider_task_key(task.provider_id, task.created_at, &task.id),
            b"",
        );
        Ok(())
    }

    fn stage_mapping(&self, batch: &mut WriteBatch, mapping: &PortMapping) -> Result<()> {
        let cf_mappings = self.cf(cf::PORT_MAPPINGS)?;
        let cf_by_instance = self.cf(cf::PORT_MAPPINGS_BY_INSTANCE)?;
        let cf_ports = self.cf(cf::HOST_PORTS)?;

        batch.put_cf(
            &cf_mappings,
            keys::mapping_key(&mapping.id),
            Self::serialize(mapping)?,
        );
        batch.put_cf(
            &cf_by_instance,
            keys::instance_mapping_key(mapping.instance_id, &mapping.id),
            b"",
        );
        for proto in mapping.protocol.expand() {
            batch.put_cf(
                &cf_ports,
                keys::host_port_key(mapping.provider_id, mapping.host_port, *proto),
                mapping.id.as_bytes(),
            );
        }
        Ok(())
    }

    fn stage_mapping_removal(&self, batch: &mut WriteBatch, mapping: &PortMapping) -> Result<()> {
        let cf_mappings = self.cf(cf::PORT_MAPPINGS)?;
        let cf_by_instance = self.cf(cf::PORT_MAPPINGS_BY_INSTANCE)?;
        let cf_ports = self.cf(cf::HOST_PORTS)?;

        batch.delete_cf(&cf_mappings, keys::mapping_key(&mapping.id));
        batch.delete_cf(
            &cf_by_instance,
            keys::instance_mapping_key(mapping.instance_id, &mapping.id),
        );
        for proto in mapping.protocol.expand() {
            batch.delete_cf(
                &cf_ports,
                keys::host_port_key(mapping.provider_id, mapping.host_port, *proto),
            );
        }
        Ok(())
    }

    fn mappings_of_instance(&self, instance_id: InstanceId) -> Result<Vec<PortMapping>> {
        let prefix = keys::instance_prefix(instance_id);
        let mut mappings = Vec::new();
        for key in self.scan_prefix(cf::PORT_MAPPINGS_BY_INSTANCE, &prefix)? {
            let mapping_id = PortMappingId::from_slice(keys::trailing_id(&key))
                .map_err(|e| StoreError::Database(e.to_string()))?;
            if let Some(mapping) = self.get_port_mapping(&mapping_id)? {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }

    /// Move the allocation cursor back to the lowest released in-range port.
    fn lower_cursor(provider: &mut Provider, released: &[PortMapping]) {
        let lowest = released
            .iter()
            .filter(|m| m.provider_id == provider.id && provider.port_in_range(m.host_port))
            .map(|m| m.host_port)
            .min();
        if let Some(port) = lowest {
            if port < provider.next_available_port {
                provider.next_available_port = port;
            }
        }
    }
}

/// Host port bookkeeping for one allocation batch.
///
/// Reservations made earlier in the same batch are not visible in the
/// database yet, so they are tracked here.
struct PortLedger<'a> {
    store: &'a RocksStore,
    provider_id: ProviderId,
    staged: HashSet<(u16, Protocol)>,
    released: HashSet<(u16, Protocol)>,
}

impl<'a> PortLedger<'a> {
    fn new(store: &'a RocksStore, provider_id: ProviderId) -> Self {
        Self {
            store,
            provider_id,
            staged: HashSet::new(),
            released: HashSet::new(),
        }
    }

    fn is_free_for(&self, port: u16, protocol: Protocol) -> Result<bool> {
        for proto in protocol.expand() {
            if self.staged.contains(&(port, *proto)) {
                return Ok(false);
            }
            if self.released.contains(&(port, *proto)) {
                continue;
            }
            let key = keys::host_port_key(self.provider_id, port, *proto);
            if self.store.exists(cf::HOST_PORTS, &key)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// A port is handed out by the allocator only if no protocol holds it.
    fn is_unused(&self, port: u16) -> Result<bool> {
        self.is_free_for(port, Protocol::Both)
    }

    fn reserve(&mut self, port: u16, protocol: Protocol) {
        for proto in protocol.expand() {
            self.staged.insert((port, *proto));
        }
    }

    fn release(&mut self, port: u16, protocol: Protocol) {
        for proto in protocol.expand() {
            self.released.insert((port, *proto));
        }
    }

    /// Find the next unused port from the provider's cursor, wrapping once.
    fn next_from_cursor(&self, provider: &mut Provider) -> Result<u16> {
        let (start, end) = (provider.port_range_start, provider.port_range_end);
        let provider_id = provider.id;
        let exhausted = move || StoreError::PortsExhausted {
            provider_id,
            start,
            end,
        };
        if end < start || start == 0 {
            return Err(exhausted());
        }

        let cursor = if provider.port_in_range(provider.next_available_port) {
            provider.next_available_port
        } else {
            start
        };

        let candidates = (cursor..=end).chain(start..cursor);
        for port in candidates {
            if self.is_unused(port)? {
                provider.next_available_port = if port >= end { start } else { port + 1 };
                return Ok(port);
            }
        }
        Err(exhausted())
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Provider Operations
    // =========================================================================

    fn put_provider(&self, provider: &Provider) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        self.stage_provider(&mut batch, provider)?;
        self.write(batch)
    }

    fn get_provider(&self, provider_id: ProviderId) -> Result<Option<Provider>> {
        self.get_value(cf::PROVIDERS, &keys::provider_key(provider_id))
    }

    fn list_providers(&self) -> Result<Vec<Provider>> {
        self.scan_all(cf::PROVIDERS)
    }

    fn update_provider(
        &self,
        provider_id: ProviderId,
        update: &mut dyn FnMut(&mut Provider),
    ) -> Result<Provider> {
        let _guard = self.write_lock.lock();
        let mut provider = self.load_provider(provider_id)?;
        update(&mut provider);
        provider.updated_at = Utc::now();

        let mut batch = WriteBatch::default();
        self.stage_provider(&mut batch, &provider)?;
        self.write(batch)?;
        Ok(provider)
    }

    // =========================================================================
    // Instance Operations
    // =========================================================================

    fn put_instance(&self, instance: &Instance) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        self.stage_instance(&mut batch, instance)?;
        self.write(batch)
    }

    fn get_instance(&self, instance_id: InstanceId) -> Result<Option<Instance>> {
        self.get_value(cf::INSTANCES, &keys::instance_key(instance_id))
    }

    fn list_instances_by_provider(&self, provider_id: ProviderId) -> Result<Vec<Instance>> {
        let prefix = keys::provider_prefix(provider_id);
        let mut instances = Vec::new();
        for key in self.scan_prefix(cf::INSTANCES_BY_PROVIDER, &prefix)? {
            let instance_id = InstanceId::from_key(&key[8..])
                .map_err(|e| StoreError::Database(e.to_string()))?;
            if let Some(instance) = self.get_instance(instance_id)? {
                instances.push(instance);
            }
        }
        Ok(instances)
    }

    fn list_all_instances(&self) -> Result<Vec<Instance>> {
        self.scan_all(cf::INSTANCES)
    }

    fn update_instance(
        &self,
        instance_id: InstanceId,
        update: &mut dyn FnMut(&mut Instance),
    ) -> Result<Instance> {
        let _guard = self.write_lock.lock();
        let mut instance: Instance = self
            .get_instance(instance_id)?
            .ok_or(StoreError::NotFound)?;
        update(&mut instance);
        instance.updated_at = Utc::now();

        let mut batch = WriteBatch::default();
        self.stage_instance(&mut batch, &instance)?;
        self.write(batch)?;
        Ok(instance)
    }

    fn purge_instance(
        &self,
        instance_id: InstanceId,
        usage: UsageDelta,
    ) -> Result<Vec<PortMapping>> {
        let _guard = self.write_lock.lock();
        let instance = self.get_instance(instance_id)?.ok_or(StoreError::NotFound)?;
        let mappings = self.mappings_of_instance(instance_id)?;

        let cf_instances = self.cf(cf::INSTANCES)?;
        let cf_by_provider = self.cf(cf::INSTANCES_BY_PROVIDER)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_instances, keys::instance_key(instance_id));
        batch.delete_cf(
            &cf_by_provider,
            keys::provider_instance_key(instance.provider_id, instance_id),
        );
        for mapping in &mappings {
            self.stage_mapping_removal(&mut batch, mapping)?;
        }

        // The provider may already be gone; the instance still has to go.
        if let Some(mut provider) = self.get_provider(instance.provider_id)? {
            provider.usage.apply(usage);
            Self::lower_cursor(&mut provider, &mappings);
            provider.updated_at = Utc::now();
            self.stage_provider(&mut batch, &provider)?;
        }

        self.write(batch)?;
        tracing::debug!(
            instance_id = %instance_id,
            released_ports = mappings.len(),
            "Purged instance"
        );
        Ok(mappings)
    }

    // =========================================================================
    // Task Operations
    // =========================================================================

    fn put_task(&self, task: &Task) -> Result<()> {
        let _guard = self.write_lock.lock();
        let old_status = self.get_task(&task.id)?.map(|t| t.status);
        let mut batch = WriteBatch::default();
        self.stage_task(&mut batch, task, old_status)?;
        self.write(batch)
    }

    fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        self.get_value(cf::TASKS, &keys::task_key(task_id))
    }

    fn update_task(
        &self,
        task_id: &TaskId,
        update: &mut dyn FnMut(&mut Task) -> bool,
    ) -> Result<Option<Task>> {
        let _guard = self.write_lock.lock();
        let mut task = self.get_task(task_id)?.ok_or(StoreError::NotFound)?;
        let old_status = task.status;

        if !update(&mut task) {
            return Ok(None);
        }
        task.updated_at = Utc::now();

        let mut batch = WriteBatch::default();
        self.stage_task(&mut batch, &task, Some(old_status))?;
        self.write(batch)?;
        Ok(Some(task))
    }

    fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let prefix = keys::status_prefix(status.as_u8());
        let mut tasks = Vec::new();
        for key in self.scan_prefix(cf::TASKS_BY_STATUS, &prefix)? {
            let task_id = TaskId::from_slice(&key[1..])
                .map_err(|e| StoreError::Database(e.to_string()))?;
            if let Some(task) = self.get_task(&task_id)? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    fn list_tasks_by_provider(&self, provider_id: ProviderId) -> Result<Vec<Task>> {
        let prefix = keys::provider_prefix(provider_id);
        let mut tasks = Vec::new();
        for key in self.scan_prefix(cf::TASKS_BY_PROVIDER, &prefix)? {
            let task_id = TaskId::from_slice(keys::trailing_id(&key))
                .map_err(|e| StoreError::Database(e.to_string()))?;
            if let Some(task) = self.get_task(&task_id)? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    fn delete_terminal_tasks_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let cf_tasks = self.cf(cf::TASKS)?;
        let cf_by_status = self.cf(cf::TASKS_BY_STATUS)?;
        let cf_by_provider = self.cf(cf::TASKS_BY_PROVIDER)?;

        let mut batch = WriteBatch::default();
        let mut deleted = 0usize;

        for status in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            for task in self.list_tasks_by_status(status)? {
                let finished = task.finished_at().unwrap_or(task.updated_at);
                if finished >= cutoff {
                    continue;
                }
                batch.delete_cf(&cf_tasks, keys::task_key(&task.id));
                batch.delete_cf(
                    &cf_by_status,
                    keys::status_task_key(task.status.as_u8(), &task.id),
                );
                batch.delete_cf(
                    &cf_by_provider,
                    keys::provider_task_key(task.provider_id, task.created_at, &task.id),
                );
                deleted += 1;
            }
        }

        if deleted > 0 {
            self.write(batch)?;
        }
        Ok(deleted)
    }

    // =========================================================================
    // Port Mapping Operations
    // =========================================================================

    fn insert_port_mappings(
        &self,
        provider_id: ProviderId,
        drafts: &[NewPortMapping],
    ) -> Result<Vec<PortMapping>> {
        let _guard = self.write_lock.lock();
        let mut provider = self.load_provider(provider_id)?;
        let mut ledger = PortLedger::new(self, provider_id);
        let mut created = Vec::with_capacity(drafts.len());
        let now = Utc::now();

        for draft in drafts {
            let host_port = match draft.host_port {
                HostPortRequest::Exact(port) => {
                    if !ledger.is_free_for(port, draft.protocol)? {
                        return Err(StoreError::PortTaken {
                            provider_id,
                            port,
                            protocol: draft.protocol.as_str(),
                        });
                    }
                    port
                }
                HostPortRequest::IfFree(port) => {
                    if !ledger.is_unused(port)? {
                        continue;
                    }
                    port
                }
                HostPortRequest::PreferOrNext(port) => {
                    if provider.port_in_range(port) && ledger.is_unused(port)? {
                        port
                    } else {
                        ledger.next_from_cursor(&mut provider)?
                    }
                }
                HostPortRequest::Next => ledger.next_from_cursor(&mut provider)?,
            };
            ledger.reserve(host_port, draft.protocol);

            created.push(PortMapping {
                id: PortMappingId::generate(),
                instance_id: draft.instance_id,
                provider_id,
                host_port,
                guest_port: draft.guest_port,
                protocol: draft.protocol,
                is_ssh: draft.is_ssh,
                is_automatic: draft.is_automatic,
                mapping_method: draft.mapping_method.clone(),
                status: PortMappingStatus::Pending,
                description: draft.description.clone(),
                ipv6_enabled: draft.ipv6_enabled,
                created_at: now,
            });
        }

        let mut batch = WriteBatch::default();
        for mapping in &created {
            self.stage_mapping(&mut batch, mapping)?;
        }
        provider.updated_at = now;
        self.stage_provider(&mut batch, &provider)?;
        self.write(batch)?;

        tracing::debug!(
            provider_id = %provider_id,
            count = created.len(),
            next_available_port = provider.next_available_port,
            "Reserved host ports"
        );
        Ok(created)
    }

    fn get_port_mapping(&self, mapping_id: &PortMappingId) -> Result<Option<PortMapping>> {
        self.get_value(cf::PORT_MAPPINGS, &keys::mapping_key(mapping_id))
    }

    fn list_port_mappings_by_instance(&self, instance_id: InstanceId) -> Result<Vec<PortMapping>> {
        self.mappings_of_instance(instance_id)
    }

    fn list_port_mappings_by_provider(&self, provider_id: ProviderId) -> Result<Vec<PortMapping>> {
        let cf_ports = self.cf(cf::HOST_PORTS)?;
        let prefix = keys::provider_prefix(provider_id);
        let iter = self
            .db
            .iterator_cf(&cf_ports, IteratorMode::From(&prefix, Direction::Forward));

        let mut seen = HashSet::new();
        let mut mappings = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let mapping_id = PortMappingId::from_slice(&value)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            if !seen.insert(mapping_id) {
                continue;
            }
            if let Some(mapping) = self.get_port_mapping(&mapping_id)? {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }

    fn update_port_mapping(
        &self,
        mapping_id: &PortMappingId,
        update: &mut dyn FnMut(&mut PortMapping),
    ) -> Result<PortMapping> {
        let _guard = self.write_lock.lock();
        let old = self
            .get_port_mapping(mapping_id)?
            .ok_or(StoreError::NotFound)?;
        let mut mapping = old.clone();
        update(&mut mapping);
        mapping.id = old.id;
        mapping.provider_id = old.provider_id;
        mapping.instance_id = old.instance_id;

        let mut batch = WriteBatch::default();
        if mapping.host_port != old.host_port || mapping.protocol != old.protocol {
            let mut ledger = PortLedger::new(self, old.provider_id);
            ledger.release(old.host_port, old.protocol);
            if !ledger.is_free_for(mapping.host_port, mapping.protocol)? {
                return Err(StoreError::PortTaken {
                    provider_id: old.provider_id,
                    port: mapping.host_port,
                    protocol: mapping.protocol.as_str(),
                });
            }
            let cf_ports = self.cf(cf::HOST_PORTS)?;
            for proto in old.protocol.expand() {
                batch.delete_cf(
                    &cf_ports,
                    keys::host_port_key(old.provider_id, old.host_port, *proto),
                );
            }
        }
        self.stage_mapping(&mut batch, &mapping)?;
        self.write(batch)?;
        Ok(mapping)
    }

    fn delete_port_mapping(&self, mapping_id: &PortMappingId) -> Result<PortMapping> {
        let _guard = self.write_lock.lock();
        let mapping = self
            .get_port_mapping(mapping_id)?
            .ok_or(StoreError::NotFound)?;

        let mut batch = WriteBatch::default();
        self.stage_mapping_removal(&mut batch, &mapping)?;
        if let Some(mut provider) = self.get_provider(mapping.provider_id)? {
            Self::lower_cursor(&mut provider, std::slice::from_ref(&mapping));
            self.stage_provider(&mut batch, &provider)?;
        }
        self.write(batch)?;
        Ok(mapping)
    }

    fn release_instance_ports(&self, instance_id: InstanceId) -> Result<Vec<PortMapping>> {
        let _guard = self.write_lock.lock();
        let mappings = self.mappings_of_instance(instance_id)?;
        if mappings.is_empty() {
            return Ok(mappings);
        }

        let mut batch = WriteBatch::default();
        for mapping in &mappings {
            self.stage_mapping_removal(&mut batch, mapping)?;
        }
        if let Some(mut provider) = self.get_provider(mappings[0].provider_id)? {
            Self::lower_cursor(&mut provider, &mappings);
            self.stage_provider(&mut batch, &provider)?;
        }
        self.write(batch)?;
        Ok(mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstanceKind, InstanceStatus, ProviderKind, TaskType};
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn create_test_provider(store: &RocksStore, id: u64, start: u16, end: u16) -> Provider {
        let mut provider = Provider::new(
            ProviderId::new(id),
            format!("node-{id}"),
            ProviderKind::Lxd,
            "192.0.2.10",
        );
        provider.port_range_start = start;
        provider.port_range_end = end;
        provider.next_available_port = start;
        store.put_provider(&provider).unwrap();
        provider
    }

    fn create_test_instance(store: &RocksStore, id: u64, provider_id: u64) -> Instance {
        let instance = Instance::new(
            InstanceId::new(id),
            ProviderId::new(provider_id),
            format!("inst-{id}"),
            InstanceKind::Container,
            "debian/12",
        );
        store.put_instance(&instance).unwrap();
        instance
    }

    fn next_drafts(instance: u64, count: usize) -> Vec<NewPortMapping> {
        (0..count)
            .map(|_| NewPortMapping::new(InstanceId::new(instance), HostPortRequest::Next, 80))
            .collect()
    }

    #[test]
    fn provider_crud() {
        let (store, _dir) = create_test_store();
        let provider = create_test_provider(&store, 1, 10000, 10010);

        let retrieved = store.get_provider(provider.id).unwrap().unwrap();
        assert_eq!(retrieved.name, "node-1");

        let updated = store
            .update_provider(provider.id, &mut |p| p.allow_claim = false)
            .unwrap();
        assert!(!updated.allow_claim);
        assert!(!store.get_provider(provider.id).unwrap().unwrap().allow_claim);

        assert_eq!(store.list_providers().unwrap().len(), 1);
        assert!(matches!(
            store.update_provider(ProviderId::new(99), &mut |_| {}),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn instances_indexed_by_provider() {
        let (store, _dir) = create_test_store();
        create_test_provider(&store, 1, 10000, 10010);
        create_test_provider(&store, 2, 10000, 10010);
        create_test_instance(&store, 10, 1);
        create_test_instance(&store, 11, 1);
        create_test_instance(&store, 12, 2);

        assert_eq!(store.list_instances_by_provider(ProviderId::new(1)).unwrap().len(), 2);
        assert_eq!(store.list_instances_by_provider(ProviderId::new(2)).unwrap().len(), 1);

        let updated = store
            .update_instance_status(InstanceId::new(10), InstanceStatus::Running)
            .unwrap();
        assert_eq!(updated.status, InstanceStatus::Running);
    }

    #[test]
    fn allocation_stays_in_range_and_advances_cursor() {
        let (store, _dir) = create_test_store();
        let provider = create_test_provider(&store, 1, 20000, 20004);

        let created = store.insert_port_mappings(provider.id, &next_drafts(1, 3)).unwrap();
        let ports: Vec<u16> = created.iter().map(|m| m.host_port).collect();
        assert_eq!(ports, vec![20000, 20001, 20002]);

        let provider = store.get_provider(provider.id).unwrap().unwrap();
        assert_eq!(provider.next_available_port, 20003);
    }

    #[test]
    fn allocation_wraps_and_then_exhausts() {
        let (store, _dir) = create_test_store();
        let provider = create_test_provider(&store, 1, 30000, 30002);

        // Occupy the start of the range, then move the cursor to the end.
        store.insert_port_mappings(provider.id, &next_drafts(1, 1)).unwrap();
        store
            .update_provider(provider.id, &mut |p| p.next_available_port = 30002)
            .unwrap();

        let created = store.insert_port_mappings(provider.id, &next_drafts(1, 2)).unwrap();
        let ports: Vec<u16> = created.iter().map(|m| m.host_port).collect();
        assert_eq!(ports, vec![30002, 30001]);

        let err = store
            .insert_port_mappings(provider.id, &next_drafts(1, 1))
            .unwrap_err();
        assert!(matches!(err, StoreError::PortsExhausted { .. }));
    }

    #[test]
    fn failed_batch_writes_nothing() {
        let (store, _dir) = create_test_store();
        let provider = create_test_provider(&store, 1, 40000, 40001);

        let err = store
            .insert_port_mappings(provider.id, &next_drafts(1, 3))
            .unwrap_err();
        assert!(matches!(err, StoreError::PortsExhausted { .. }));
        assert!(store
            .list_port_mappings_by_provider(provider.id)
            .unwrap()
            .is_empty());
        assert_eq!(
            store.get_provider(provider.id).unwrap().unwrap().next_available_port,
            40000
        );
    }

    #[test]
    fn both_reserves_tcp_and_udp() {
        let (store, _dir) = create_test_store();
        let provider = create_test_provider(&store, 1, 10000, 10100);

        let both = NewPortMapping::new(InstanceId::new(1), HostPortRequest::Exact(10050), 22)
            .with_protocol(Protocol::Both);
        store.insert_port_mappings(provider.id, &[both]).unwrap();

        for proto in [Protocol::Tcp, Protocol::Udp] {
            let draft = NewPortMapping::new(InstanceId::new(2), HostPortRequest::Exact(10050), 22)
                .with_protocol(proto);
            let err = store.insert_port_mappings(provider.id, &[draft]).unwrap_err();
            assert!(matches!(err, StoreError::PortTaken { port: 10050, .. }));
        }

        // Same port on another provider is fine.
        let other = create_test_provider(&store, 2, 10000, 10100);
        let draft = NewPortMapping::new(InstanceId::new(3), HostPortRequest::Exact(10050), 22);
        store.insert_port_mappings(other.id, &[draft]).unwrap();
    }

    #[test]
    fn tcp_and_udp_may_share_a_port_explicitly() {
        let (store, _dir) = create_test_store();
        let provider = create_test_provider(&store, 1, 10000, 10100);

        let tcp = NewPortMapping::new(InstanceId::new(1), HostPortRequest::Exact(10060), 53);
        let udp = NewPortMapping::new(InstanceId::new(1), HostPortRequest::Exact(10060), 53)
            .with_protocol(Protocol::Udp);
        let created = store.insert_port_mappings(provider.id, &[tcp, udp]).unwrap();
        assert_eq!(created.len(), 2);
        // Listing deduplicates by mapping, not by port.
        assert_eq!(store.list_port_mappings_by_provider(provider.id).unwrap().len(), 2);
    }

    #[test]
    fn if_free_skips_taken_ports() {
        let (store, _dir) = create_test_store();
        let provider = create_test_provider(&store, 1, 10000, 10010);
        let taken = NewPortMapping::new(InstanceId::new(1), HostPortRequest::Exact(10002), 80);
        store.insert_port_mappings(provider.id, &[taken]).unwrap();

        let drafts: Vec<_> = (10001..=10003)
            .map(|p| NewPortMapping::new(InstanceId::new(2), HostPortRequest::IfFree(p), p))
            .collect();
        let created = store.insert_port_mappings(provider.id, &drafts).unwrap();
        let ports: Vec<u16> = created.iter().map(|m| m.host_port).collect();
        assert_eq!(ports, vec![10001, 10003]);
    }

    #[test]
    fn release_lowers_cursor() {
        let (store, _dir) = create_test_store();
        let provider = create_test_provider(&store, 1, 10000, 10010);
        create_test_instance(&store, 1, 1);

        let created = store.insert_port_mappings(provider.id, &next_drafts(1, 4)).unwrap();
        assert_eq!(
            store.get_provider(provider.id).unwrap().unwrap().next_available_port,
            10004
        );

        store.delete_port_mapping(&created[1].id).unwrap();
        assert_eq!(
            store.get_provider(provider.id).unwrap().unwrap().next_available_port,
            10001
        );

        // The freed port is handed out again.
        let again = store.insert_port_mappings(provider.id, &next_drafts(1, 1)).unwrap();
        assert_eq!(again[0].host_port, 10001);

        let released = store.release_instance_ports(InstanceId::new(1)).unwrap();
        assert_eq!(released.len(), 4);
        assert_eq!(
            store.get_provider(provider.id).unwrap().unwrap().next_available_port,
            10000
        );
    }

    #[test]
    fn update_port_mapping_moves_reservation() {
        let (store, _dir) = create_test_store();
        let provider = create_test_provider(&store, 1, 10000, 10010);
        let draft = NewPortMapping::new(InstanceId::new(1), HostPortRequest::Exact(10005), 80);
        let mapping = store.insert_port_mappings(provider.id, &[draft]).unwrap().remove(0);

        let updated = store
            .update_port_mapping(&mapping.id, &mut |m| {
                m.protocol = Protocol::Udp;
                m.guest_port = 8080;
                m.status = PortMappingStatus::Active;
            })
            .unwrap();
        assert_eq!(updated.guest_port, 8080);

        // TCP on 10005 is free again, UDP is not.
        let tcp = NewPortMapping::new(InstanceId::new(2), HostPortRequest::Exact(10005), 80);
        store.insert_port_mappings(provider.id, &[tcp]).unwrap();
        let udp = NewPortMapping::new(InstanceId::new(2), HostPortRequest::Exact(10005), 80)
            .with_protocol(Protocol::Udp);
        assert!(store.insert_port_mappings(provider.id, &[udp]).is_err());
    }

    #[test]
    fn concurrent_allocation_hands_out_unique_ports() {
        let (store, _dir) = create_test_store();
        let provider_id = create_test_provider(&store, 1, 50000, 50199).id;
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut ports = Vec::new();
                    for _ in 0..20 {
                        let created = store
                            .insert_port_mappings(provider_id, &next_drafts(i, 1))
                            .unwrap();
                        ports.push(created[0].host_port);
                    }
                    ports
                })
            })
            .collect();

        let mut all: Vec<u16> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(all.len(), 160);
        assert!(all.iter().all(|p| (50000..=50199).contains(p)));
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 160);
    }

    #[test]
    fn purge_instance_releases_everything() {
        let (store, _dir) = create_test_store();
        let provider = create_test_provider(&store, 1, 10000, 10010);
        let instance = create_test_instance(&store, 7, 1);
        let delta = UsageDelta::for_instance(&instance);
        store.adjust_provider_usage(provider.id, delta).unwrap();
        store.insert_port_mappings(provider.id, &next_drafts(7, 2)).unwrap();

        let released = store.purge_instance(instance.id, delta.negate()).unwrap();
        assert_eq!(released.len(), 2);
        assert!(store.get_instance(instance.id).unwrap().is_none());
        assert!(store.list_instances_by_provider(provider.id).unwrap().is_empty());
        assert!(store.list_port_mappings_by_instance(instance.id).unwrap().is_empty());

        let provider = store.get_provider(provider.id).unwrap().unwrap();
        assert_eq!(provider.usage.container_count, 0);
        assert_eq!(provider.next_available_port, 10000);
    }

    #[test]
    fn task_status_index_follows_updates() {
        let (store, _dir) = create_test_store();
        let task = Task::new(
            ProviderId::new(1),
            Some(InstanceId::new(1)),
            TaskType::Start,
            serde_json::Value::Null,
            300,
        );
        store.put_task(&task).unwrap();
        assert_eq!(store.list_tasks_by_status(TaskStatus::Pending).unwrap().len(), 1);

        let updated = store
            .update_task(&task.id, &mut |t| {
                t.status = TaskStatus::Running;
                true
            })
            .unwrap();
        assert!(updated.is_some());
        assert!(store.list_tasks_by_status(TaskStatus::Pending).unwrap().is_empty());
        assert_eq!(store.list_tasks_by_status(TaskStatus::Running).unwrap().len(), 1);
    }

    #[test]
    fn declined_task_update_writes_nothing() {
        let (store, _dir) = create_test_store();
        let task = Task::new(ProviderId::new(1), None, TaskType::Stop, serde_json::Value::Null, 300);
        store.put_task(&task).unwrap();

        let result = store
            .update_task(&task.id, &mut |t| {
                t.progress = 50;
                false
            })
            .unwrap();
        assert!(result.is_none());
        assert_eq!(store.get_task(&task.id).unwrap().unwrap().progress, 0);
    }

    #[test]
    fn provider_tasks_listed_oldest_first() {
        let (store, _dir) = create_test_store();
        let mut first = Task::new(ProviderId::new(1), None, TaskType::Start, serde_json::Value::Null, 300);
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = Task::new(ProviderId::new(1), None, TaskType::Stop, serde_json::Value::Null, 300);
        let other = Task::new(ProviderId::new(2), None, TaskType::Stop, serde_json::Value::Null, 300);
        store.put_task(&second).unwrap();
        store.put_task(&first).unwrap();
        store.put_task(&other).unwrap();

        let tasks = store.list_tasks_by_provider(ProviderId::new(1)).unwrap();
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[test]
    fn retention_deletes_only_old_terminal_tasks() {
        let (store, _dir) = create_test_store();
        let old_time = Utc::now() - chrono::Duration::days(40);

        let mut old_done = Task::new(ProviderId::new(1), None, TaskType::Start, serde_json::Value::Null, 300);
        old_done.status = TaskStatus::Completed;
        old_done.completed_at = Some(old_time);
        store.put_task(&old_done).unwrap();

        let mut recent_failed = Task::new(ProviderId::new(1), None, TaskType::Stop, serde_json::Value::Null, 300);
        recent_failed.status = TaskStatus::Failed;
        recent_failed.completed_at = Some(Utc::now());
        store.put_task(&recent_failed).unwrap();

        let mut old_pending = Task::new(ProviderId::new(1), None, TaskType::Stop, serde_json::Value::Null, 300);
        old_pending.created_at = old_time;
        store.put_task(&old_pending).unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        assert_eq!(store.delete_terminal_tasks_before(cutoff).unwrap(), 1);
        assert!(store.get_task(&old_done.id).unwrap().is_none());
        assert!(store.get_task(&recent_failed.id).unwrap().is_some());
        assert!(store.get_task(&old_pending.id).unwrap().is_some());
        assert_eq!(store.list_tasks_by_provider(ProviderId::new(1)).unwrap().len(), 2);
    }
}
