//! Backend abstraction for virtfleet providers.
//!
//! A provider is a remote host running Docker, LXD, Incus, or Proxmox VE.
//! This crate defines what a backend can do and implements it for each
//! family:
//!
//! - **Capabilities**: [`Connection`], [`Lifecycle`], [`ImageManagement`] and
//!   [`HealthCheck`], combined as [`ProviderBackend`]
//! - **Registry**: [`ProviderRegistry`] maps a [`ProviderKind`] to a
//!   constructor; [`ProviderPool`] caches one backend per provider
//! - **Transport**: [`RemoteSession`] over SSH and [`ApiClient`] for REST APIs
//! - **Health**: [`HealthChecker`] runs SSH, API and service checks
//! - **Retries**: [`RetryPolicy`] retries destructive calls on connectivity
//!   failures, reconnecting between attempts
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use virtfleet_core::ProviderId;
//! use virtfleet_provider::{BackendOptions, ProviderPool, ProviderRegistry};
//! use virtfleet_store::{Provider, ProviderKind};
//!
//! # async fn example() -> virtfleet_provider::Result<()> {
//! let registry = Arc::new(ProviderRegistry::with_builtin(BackendOptions::default()));
//! let pool = ProviderPool::new(registry);
//!
//! let provider = Provider::new(ProviderId::new(1), "edge-1", ProviderKind::Docker, "203.0.113.5");
//! let backend = pool.connected(&provider).await?;
//! for instance in backend.list_instances().await? {
//!     println!("{} {}", instance.name, instance.status);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`ProviderKind`]: virtfleet_store::ProviderKind

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod backends;
pub mod capability;
pub mod error;
pub mod health;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use api::{ApiAuth, ApiClient};
pub use backends::image::CdnConfig;
pub use backends::{CliFlavor, DockerBackend, HypervisorBackend, ProxmoxBackend};
pub use capability::{
    no_progress, Connection, HealthCheck, ImageInfo, ImageManagement, InstanceInfo, InstanceSpec,
    Lifecycle, PortSpec, ProgressFn, ProviderBackend,
};
pub use error::{ProviderError, Result};
pub use health::{CheckOutcome, HealthChecker, HealthConfig, HealthResult, HealthStatus};
pub use pool::ProviderPool;
pub use registry::{BackendFactory, BackendOptions, ProviderRegistry};
pub use retry::RetryPolicy;
pub use transport::{shell_quote, CommandOutput, RemoteSession, RemoteShell, SshShell, SshTarget};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockProvider;
#[cfg(any(test, feature = "test-utils"))]
pub use transport::mock::MockShell;
