//! `RocksDB` storage layer for virtfleet.
//!
//! This crate provides persistent storage for providers, instances, tasks,
//! and port mappings using `RocksDB` with column families for efficient
//! indexing. Every multi-record change (port allocation with its cursor,
//! instance purge with its mappings and usage counters, task status with its
//! index) is written as a single `WriteBatch`.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `providers`: Provider records, keyed by `provider_id`
//! - `instances`: Instance records, keyed by `instance_id`
//! - `instances_by_provider`: Index for listing instances by provider
//! - `tasks`: Task records, keyed by `task_id`
//! - `tasks_by_status`: Index for listing tasks by status
//! - `tasks_by_provider`: Index for listing a provider's tasks oldest first
//! - `port_mappings`: Port mapping records, keyed by `mapping_id`
//! - `port_mappings_by_instance`: Index for listing mappings by instance
//! - `host_ports`: Host port reservations per provider and protocol
//!
//! # Example
//!
//! ```no_run
//! use virtfleet_core::ProviderId;
//! use virtfleet_store::{HostPortRequest, NewPortMapping, RocksStore, Store};
//! use virtfleet_core::InstanceId;
//!
//! let store = RocksStore::open("/tmp/virtfleet-db").unwrap();
//!
//! // Reserve the next free host port for guest port 80
//! let draft = NewPortMapping::new(InstanceId::new(42), HostPortRequest::Next, 80);
//! let created = store.insert_port_mappings(ProviderId::new(1), &[draft]).unwrap();
//! println!("allocated host port {}", created[0].host_port);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{
    CheckStatus, Credentials, ExecutionRule, HostPortRequest, Instance, InstanceKind,
    InstanceStatus, NetworkType, NewPortMapping, PortMapping, PortMappingStatus, Protocol,
    Provider, ProviderKind, ProviderStatus, ProviderUsage, ResourceFacts, ResourceSpec, Task,
    TaskStatus, TaskType, UsageDelta,
};

use chrono::{DateTime, Utc};
use virtfleet_core::{InstanceId, PortMappingId, ProviderId, TaskId};

/// The storage trait defining all database operations.
///
/// Read-modify-write operations take a closure and run it while holding the
/// store's write lock, so concurrent callers never lose each other's updates.
pub trait Store: Send + Sync {
    // =========================================================================
    // Provider Operations
    // =========================================================================

    /// Insert or replace a provider record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_provider(&self, provider: &Provider) -> Result<()>;

    /// Get a provider by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_provider(&self, provider_id: ProviderId) -> Result<Option<Provider>>;

    /// List all providers, including soft-deleted ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_providers(&self) -> Result<Vec<Provider>>;

    /// Apply `update` to a provider and persist the result atomically.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the provider doesn't exist.
    fn update_provider(
        &self,
        provider_id: ProviderId,
        update: &mut dyn FnMut(&mut Provider),
    ) -> Result<Provider>;

    /// Apply a resource delta to a provider's usage counters.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the provider doesn't exist.
    fn adjust_provider_usage(&self, provider_id: ProviderId, delta: UsageDelta) -> Result<Provider> {
        self.update_provider(provider_id, &mut |p| p.usage.apply(delta))
    }

    // =========================================================================
    // Instance Operations
    // =========================================================================

    /// Insert or replace an instance record, maintaining the provider index.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_instance(&self, instance: &Instance) -> Result<()>;

    /// Get an instance by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_instance(&self, instance_id: InstanceId) -> Result<Option<Instance>>;

    /// List all instances hosted on a provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_instances_by_provider(&self, provider_id: ProviderId) -> Result<Vec<Instance>>;

    /// List every instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_all_instances(&self) -> Result<Vec<Instance>>;

    /// Apply `update` to an instance and persist the result atomically.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the instance doesn't exist.
    fn update_instance(
        &self,
        instance_id: InstanceId,
        update: &mut dyn FnMut(&mut Instance),
    ) -> Result<Instance>;

    /// Update an instance's status.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the instance doesn't exist.
    fn update_instance_status(
        &self,
        instance_id: InstanceId,
        status: InstanceStatus,
    ) -> Result<Instance> {
        self.update_instance(instance_id, &mut |i| i.status = status)
    }

    /// Delete an instance together with its port mappings and apply `usage`
    /// to its provider, all in one write.
    ///
    /// Returns the mappings that were released.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the instance doesn't exist.
    fn purge_instance(&self, instance_id: InstanceId, usage: UsageDelta)
        -> Result<Vec<PortMapping>>;

    // =========================================================================
    // Task Operations
    // =========================================================================

    /// Insert or replace a task record, maintaining the status and provider indexes.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_task(&self, task: &Task) -> Result<()>;

    /// Get a task by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>>;

    /// Conditionally update a task.
    ///
    /// `update` receives the current record and returns whether the change
    /// should be written. Returns `Some(task)` when written, `None` when the
    /// closure declined.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the task doesn't exist.
    fn update_task(
        &self,
        task_id: &TaskId,
        update: &mut dyn FnMut(&mut Task) -> bool,
    ) -> Result<Option<Task>>;

    /// List all tasks with a given status.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;

    /// List a provider's tasks, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_tasks_by_provider(&self, provider_id: ProviderId) -> Result<Vec<Task>>;

    /// Delete terminal tasks that finished before `cutoff`.
    ///
    /// Returns the number of deleted tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn delete_terminal_tasks_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    // =========================================================================
    // Port Mapping Operations
    // =========================================================================

    /// Reserve host ports and insert mappings on one provider in a single write.
    ///
    /// Allocation draws from the provider's range starting at its cursor,
    /// wrapping to the range start. Drafts with [`HostPortRequest::IfFree`]
    /// whose port is taken are skipped; every other draft must succeed or
    /// nothing is written.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PortTaken` for an exact port that is reserved,
    /// `StoreError::PortsExhausted` when the range has no free port, and
    /// `StoreError::NotFound` if the provider doesn't exist.
    fn insert_port_mappings(
        &self,
        provider_id: ProviderId,
        drafts: &[NewPortMapping],
    ) -> Result<Vec<PortMapping>>;

    /// Get a port mapping by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_port_mapping(&self, mapping_id: &PortMappingId) -> Result<Option<PortMapping>>;

    /// List all mappings of an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_port_mappings_by_instance(&self, instance_id: InstanceId) -> Result<Vec<PortMapping>>;

    /// List all mappings holding host ports on a provider, ordered by host port.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_port_mappings_by_provider(&self, provider_id: ProviderId) -> Result<Vec<PortMapping>>;

    /// Apply `update` to a mapping, moving its host port reservations if the
    /// host port or protocol changed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the mapping doesn't exist and
    /// `StoreError::PortTaken` if the new host port is reserved.
    fn update_port_mapping(
        &self,
        mapping_id: &PortMappingId,
        update: &mut dyn FnMut(&mut PortMapping),
    ) -> Result<PortMapping>;

    /// Delete a mapping and release its host ports.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the mapping doesn't exist.
    fn delete_port_mapping(&self, mapping_id: &PortMappingId) -> Result<PortMapping>;

    /// Delete every mapping of an instance and release their host ports.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn release_instance_ports(&self, instance_id: InstanceId) -> Result<Vec<PortMapping>>;
}
