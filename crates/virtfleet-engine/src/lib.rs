//! Task engine for virtfleet.
//!
//! Tasks are the only way instances change. Each one is bound to a provider
//! and runs in its own Tokio task once the provider has a free execution
//! slot:
//!
//! - Providers that disallow concurrency run one task at a time and refuse
//!   to queue a second.
//! - Providers that allow it run up to `max_concurrent_tasks` and queue the
//!   rest, oldest first.
//!
//! Cancellation is cooperative. Timeouts are enforced from outside by
//! [`TaskEngine::sweep_timeouts`], which the scheduler calls periodically.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use virtfleet_core::{InstanceId, ProviderId};
//! use virtfleet_engine::{CreateTaskRequest, EngineConfig, TaskEngine};
//! use virtfleet_portmap::{PortMapper, PortMappingRegistry};
//! use virtfleet_provider::{BackendOptions, ProviderPool, ProviderRegistry};
//! use virtfleet_store::{RocksStore, TaskType};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RocksStore::open("/tmp/virtfleet-db")?);
//! let pool = Arc::new(ProviderPool::new(Arc::new(ProviderRegistry::with_builtin(
//!     BackendOptions::default(),
//! ))));
//! let ports = Arc::new(PortMapper::new(
//!     Arc::clone(&store),
//!     Arc::clone(&pool),
//!     Arc::new(PortMappingRegistry::with_builtin()),
//! ));
//! let engine = TaskEngine::new(store, pool, ports, EngineConfig::from_env());
//!
//! let task = engine.create_task(CreateTaskRequest::new(
//!     ProviderId::new(1),
//!     Some(InstanceId::new(42)),
//!     TaskType::Restart,
//! ))?;
//! println!("queued {}", task.id);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod engine;
pub mod error;
pub mod executors;
pub mod slots;
pub mod types;

pub use config::EngineConfig;
pub use engine::{TaskEngine, RESTART_CANCEL_REASON};
pub use error::{Result, TaskError};
pub use executors::generate_password;
pub use slots::{CancelToken, RunningSlots};
pub use types::{CreateInstancePayload, CreateTaskRequest, PasswordReset};
