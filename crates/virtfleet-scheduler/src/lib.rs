//! Periodic loops for virtfleet.
//!
//! The [`Scheduler`] keeps the fleet honest between tasks:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Scheduler                           │
//! │  ┌──────────────┐  ┌───────────────────┐  ┌───────────────┐  │
//! │  │ Health loop  │  │ Maintenance loop  │  │ Traffic loop  │  │
//! │  │  (3 min)     │  │ (5 min, sweep 1m) │  │   (5 min)     │  │
//! │  └──────┬───────┘  └─────────┬─────────┘  └───────┬───────┘  │
//! └─────────┼────────────────────┼────────────────────┼──────────┘
//!           ▼                    ▼                    ▼
//!     ProviderPool          TaskEngine           TrafficSync
//!     (health checks)   (sweep, cleanup,       (external meter)
//!                         dispatch)
//! ```
//!
//! Health results only gate admission of new instances through
//! `allow_claim`; see [`admission`]. Running instances are never touched.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::watch;
//! use virtfleet_engine::TaskEngine;
//! use virtfleet_scheduler::{Scheduler, SchedulerConfig};
//! use virtfleet_store::RocksStore;
//!
//! # async fn example(engine: Arc<TaskEngine<RocksStore>>) {
//! let scheduler = Arc::new(Scheduler::new(engine, SchedulerConfig::from_env()));
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handles = scheduler.spawn(shutdown_rx);
//!
//! // ... later
//! let _ = shutdown_tx.send(true);
//! for handle in handles {
//!     let _ = handle.await;
//! }
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod admission;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod scheduler;

pub use collaborators::{NoopSessionPruner, NoopTrafficSync, SessionPruner, TrafficSync};
pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use scheduler::{HealthReport, MaintenanceReport, Scheduler};
