//! Error types for the scheduler crate.

use thiserror::Error;
use virtfleet_core::ErrorKind;

/// Errors that can occur during scheduling operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] virtfleet_store::StoreError),

    /// Task engine error.
    #[error("Task error: {0}")]
    Task(#[from] virtfleet_engine::TaskError),

    /// Backend error.
    #[error("Provider error: {0}")]
    Provider(#[from] virtfleet_provider::ProviderError),

    /// Port mapping error.
    #[error("Port mapping error: {0}")]
    PortMap(#[from] virtfleet_portmap::PortMapError),

    /// An external collaborator (metering, session store) failed.
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        /// Which collaborator.
        collaborator: &'static str,
        /// What went wrong.
        message: String,
    },
}

impl SchedulerError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Task(e) => e.kind(),
            Self::Provider(e) => e.kind(),
            Self::PortMap(e) => e.kind(),
            Self::Collaborator { .. } => ErrorKind::Internal,
        }
    }

    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// Get the HTTP status code for this error.
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        self.kind().http_status_code()
    }
}

/// A specialized Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
