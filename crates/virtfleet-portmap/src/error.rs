//! Error types for port mapping operations.

use thiserror::Error;
use virtfleet_core::{ErrorKind, InstanceId, PortMappingId, ProviderId};
use virtfleet_provider::ProviderError;
use virtfleet_store::{ProviderKind, StoreError};

/// A result type using `PortMapError`.
pub type Result<T> = std::result::Result<T, PortMapError>;

/// Errors that can occur while managing port mappings.
#[derive(Debug, Error)]
pub enum PortMapError {
    /// The request is malformed.
    #[error("invalid port mapping: {0}")]
    Validation(String),

    /// The instance does not exist.
    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// The provider does not exist.
    #[error("provider not found: {0}")]
    ProviderNotFound(ProviderId),

    /// The mapping does not exist.
    #[error("port mapping not found: {0}")]
    MappingNotFound(PortMappingId),

    /// No mapping method is registered for the provider kind.
    #[error("no port mapping method for provider kind {0:?}")]
    NoMethod(ProviderKind),

    /// Backend failure while configuring the mapping.
    #[error("backend error: {0}")]
    Provider(#[from] ProviderError),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl PortMapError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::InstanceNotFound(_) | Self::ProviderNotFound(_) | Self::MappingNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::NoMethod(_) => ErrorKind::Capability,
            Self::Provider(e) => e.kind(),
            Self::Store(e) => e.kind(),
        }
    }

    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        self.kind().http_status_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_conflicts_surface_as_conflicts() {
        let err = PortMapError::from(StoreError::PortTaken {
            provider_id: ProviderId::new(1),
            port: 10022,
            protocol: "tcp",
        });
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.http_status_code(), 409);

        assert_eq!(
            PortMapError::Validation("guest port 0".into()).http_status_code(),
            400
        );
    }
}
