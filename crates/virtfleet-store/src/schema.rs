//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Primary provider records, keyed by `provider_id`.
    pub const PROVIDERS: &str = "providers";

    /// Primary instance records, keyed by `instance_id`.
    pub const INSTANCES: &str = "instances";

    /// Index: instances by provider, keyed by `provider_id || instance_id`.
    pub const INSTANCES_BY_PROVIDER: &str = "instances_by_provider";

    /// Primary task records, keyed by `task_id`.
    pub const TASKS: &str = "tasks";

    /// Index: tasks by status, keyed by `status || task_id`.
    pub const TASKS_BY_STATUS: &str = "tasks_by_status";

    /// Index: tasks by provider in creation order,
    /// keyed by `provider_id || created_millis || task_id`.
    pub const TASKS_BY_PROVIDER: &str = "tasks_by_provider";

    /// Primary port mapping records, keyed by `mapping_id`.
    pub const PORT_MAPPINGS: &str = "port_mappings";

    /// Index: port mappings by instance, keyed by `instance_id || mapping_id`.
    pub const PORT_MAPPINGS_BY_INSTANCE: &str = "port_mappings_by_instance";

    /// Host port reservations, keyed by `provider_id || host_port || protocol`,
    /// value is the owning `mapping_id`.
    pub const HOST_PORTS: &str = "host_ports";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::PROVIDERS,
        cf::INSTANCES,
        cf::INSTANCES_BY_PROVIDER,
        cf::TASKS,
        cf::TASKS_BY_STATUS,
        cf::TASKS_BY_PROVIDER,
        cf::PORT_MAPPINGS,
        cf::PORT_MAPPINGS_BY_INSTANCE,
        cf::HOST_PORTS,
    ]
}
