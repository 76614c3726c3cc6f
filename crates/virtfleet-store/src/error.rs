//! Error types for the storage layer.

use thiserror::Error;
use virtfleet_core::{ErrorKind, ProviderId};

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record was not found.
    #[error("record not found")]
    NotFound,

    /// A host port is already reserved.
    #[error("port {port}/{protocol} already allocated on provider {provider_id}")]
    PortTaken {
        /// Provider owning the range.
        provider_id: ProviderId,
        /// The contested host port.
        port: u16,
        /// The contested protocol.
        protocol: &'static str,
    },

    /// Every port in the provider's range is reserved.
    #[error("no available port in range {start}-{end} on provider {provider_id}")]
    PortsExhausted {
        /// Provider owning the range.
        provider_id: ProviderId,
        /// Range start.
        start: u16,
        /// Range end.
        end: u16,
    },

    /// A database error occurred.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound,
            Self::PortTaken { .. } | Self::PortsExhausted { .. } => ErrorKind::Conflict,
            Self::Database(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }
}
