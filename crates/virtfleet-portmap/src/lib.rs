//! Port mapping for virtfleet instances.
//!
//! Instances on NAT networks are reached through host ports forwarded to
//! guest ports. This crate reserves those host ports in the store and
//! configures the forwards on the provider with the method its backend
//! supports:
//!
//! | Method | Kinds | Live changes |
//! |--------|-------|--------------|
//! | [`ProxyDevice`] | lxd, incus | yes, one device per contiguous block |
//! | [`GostTunnel`] | proxmox | yes, one systemd unit per port |
//! | [`DockerNative`] | docker | no, the container is recreated |
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use virtfleet_core::InstanceId;
//! use virtfleet_portmap::{PortMapper, PortMappingRegistry, PortMappingRequest};
//! use virtfleet_provider::{BackendOptions, ProviderPool, ProviderRegistry};
//! use virtfleet_store::RocksStore;
//!
//! # async fn example() -> virtfleet_portmap::Result<()> {
//! let store = Arc::new(RocksStore::open("/tmp/virtfleet-db")?);
//! let pool = Arc::new(ProviderPool::new(Arc::new(ProviderRegistry::with_builtin(
//!     BackendOptions::default(),
//! ))));
//! let mapper = PortMapper::new(store, pool, Arc::new(PortMappingRegistry::with_builtin()));
//!
//! let view = mapper
//!     .create_mapping(&PortMappingRequest {
//!         instance_id: InstanceId::new(42),
//!         host_port: None,
//!         guest_port: 443,
//!         protocol: Some("tcp".into()),
//!         description: "https".into(),
//!         ipv6_enabled: false,
//!     })
//!     .await?;
//! println!("{}:{} -> {}", view.public_ip, view.host_port, view.guest_port);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod docker_native;
pub mod error;
pub mod gost;
pub mod method;
pub mod proxy_device;
pub mod registry;
pub mod service;
pub mod types;

pub use docker_native::DockerNative;
pub use error::{PortMapError, Result};
pub use gost::GostTunnel;
pub use method::{MappingTarget, ObservedMapping, PortMappingMethod};
pub use proxy_device::{coalesce, DeviceSpec, ProxyDevice};
pub use registry::{MethodFactory, PortMappingRegistry};
pub use service::PortMapper;
pub use types::{
    PortMappingDeletion, PortMappingRequest, PortMappingUpdate, PortMappingView, ValidatedMapping,
};
