//! Core types and utilities for virtfleet.
//!
//! This crate provides the foundational types shared by every other crate:
//!
//! - **Identifiers**: Strongly-typed IDs for providers, instances, tasks, and port mappings
//! - **Error taxonomy**: The [`ErrorKind`] classification each crate's error maps onto
//!
//! # Example
//!
//! ```
//! use virtfleet_core::{ErrorKind, ProviderId, TaskId};
//!
//! let provider_id: ProviderId = "7".parse().unwrap();
//! assert_eq!(provider_id.get(), 7);
//!
//! let task_id = TaskId::generate();
//! assert_eq!(task_id.to_string().len(), 36);
//!
//! assert!(ErrorKind::Connectivity.is_retriable());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;

pub use error::{is_connectivity_message, ErrorKind};
pub use ids::{IdError, InstanceId, PortMappingId, ProviderId, TaskId};
