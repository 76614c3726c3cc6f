//! Key encoding utilities for `RocksDB`.
//!
//! All numeric components are big-endian so that prefix scans return records
//! in ID (or time) order.

use chrono::{DateTime, Utc};
use virtfleet_core::{InstanceId, PortMappingId, ProviderId, TaskId};

use crate::types::Protocol;

/// Encode a provider key.
#[must_use]
pub fn provider_key(provider_id: ProviderId) -> Vec<u8> {
    provider_id.to_bytes().to_vec()
}

/// Encode an instance key.
#[must_use]
pub fn instance_key(instance_id: InstanceId) -> Vec<u8> {
    instance_id.to_bytes().to_vec()
}

/// Encode a provider-instance index key: `provider_id || instance_id`.
#[must_use]
pub fn provider_instance_key(provider_id: ProviderId, instance_id: InstanceId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&provider_id.to_bytes());
    key.extend_from_slice(&instance_id.to_bytes());
    key
}

/// Encode a provider prefix for scanning provider-scoped indexes.
#[must_use]
pub fn provider_prefix(provider_id: ProviderId) -> Vec<u8> {
    provider_id.to_bytes().to_vec()
}

/// Encode a task key.
#[must_use]
pub fn task_key(task_id: &TaskId) -> Vec<u8> {
    task_id.as_bytes().to_vec()
}

/// Encode a status-task index key: `status || task_id`.
#[must_use]
pub fn status_task_key(status: u8, task_id: &TaskId) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(status);
    key.extend_from_slice(task_id.as_bytes());
    key
}

/// Encode a status prefix for scanning tasks by status.
#[must_use]
pub fn status_prefix(status: u8) -> Vec<u8> {
    vec![status]
}

/// Encode a provider-task index key: `provider_id || created_millis || task_id`.
///
/// Scanning a provider prefix yields its tasks oldest first.
#[must_use]
pub fn provider_task_key(
    provider_id: ProviderId,
    created_at: DateTime<Utc>,
    task_id: &TaskId,
) -> Vec<u8> {
    let millis = u64::try_from(created_at.timestamp_millis()).unwrap_or(0);
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(&provider_id.to_bytes());
    key.extend_from_slice(&millis.to_be_bytes());
    key.extend_from_slice(task_id.as_bytes());
    key
}

/// Encode a port mapping key.
#[must_use]
pub fn mapping_key(mapping_id: &PortMappingId) -> Vec<u8> {
    mapping_id.as_bytes().to_vec()
}

/// Encode an instance-mapping index key: `instance_id || mapping_id`.
#[must_use]
pub fn instance_mapping_key(instance_id: InstanceId, mapping_id: &PortMappingId) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&instance_id.to_bytes());
    key.extend_from_slice(mapping_id.as_bytes());
    key
}

/// Encode an instance prefix for scanning mappings by instance.
#[must_use]
pub fn instance_prefix(instance_id: InstanceId) -> Vec<u8> {
    instance_id.to_bytes().to_vec()
}

/// Encode a host port reservation key: `provider_id || host_port || protocol`.
///
/// Only concrete protocols are stored; `Both` reserves one key per transport.
#[must_use]
pub fn host_port_key(provider_id: ProviderId, port: u16, protocol: Protocol) -> Vec<u8> {
    let mut key = Vec::with_capacity(11);
    key.extend_from_slice(&provider_id.to_bytes());
    key.extend_from_slice(&port.to_be_bytes());
    key.push(protocol.as_u8());
    key
}

/// Extract the trailing 16-byte ID segment from an index key.
#[must_use]
pub fn trailing_id(key: &[u8]) -> &[u8] {
    &key[key.len().saturating_sub(16)..]
}

/// Extract the host port from a host port reservation key.
#[must_use]
pub fn port_from_host_port_key(key: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = key.get(8..10)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}
