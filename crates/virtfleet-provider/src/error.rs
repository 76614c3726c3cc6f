//! Error types for the provider crate.

use thiserror::Error;
use virtfleet_core::{is_connectivity_message, ErrorKind};
use virtfleet_store::{ProviderKind, StoreError};

/// Errors that can occur while talking to a backend.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Transport failure: the host could not be reached or the session broke.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// A remote operation did not finish within its deadline.
    #[error("{operation} timed out after {secs}s")]
    Timeout {
        /// What was running.
        operation: String,
        /// The deadline that elapsed.
        secs: u64,
    },

    /// The backend has not been connected yet.
    #[error("{0} backend not connected")]
    NotConnected(&'static str),

    /// The instance, image, or remote object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend does not support the operation.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        /// Backend name.
        backend: &'static str,
        /// Operation name.
        operation: &'static str,
    },

    /// No constructor is registered for a provider kind.
    #[error("no backend registered for provider kind {0:?}")]
    NotRegistered(ProviderKind),

    /// A remote command exited unsuccessfully.
    #[error("command `{command}` failed (exit {exit_code:?}): {stderr}")]
    Command {
        /// The command, truncated.
        command: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Captured stderr, truncated.
        stderr: String,
    },

    /// A backend API returned an error status.
    #[error("API error (HTTP {status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Output from the backend could not be interpreted.
    #[error("unexpected backend output: {0}")]
    Parse(String),

    /// The provider record is missing something this backend needs.
    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ProviderError {
    /// Build a command failure, promoting it to a connectivity error when the
    /// captured output describes a transport failure.
    #[must_use]
    pub fn command(command: &str, exit_code: Option<i32>, stderr: &str) -> Self {
        if is_connectivity_message(stderr) {
            return Self::Connectivity(truncate(stderr.trim(), 300));
        }
        Self::Command {
            command: truncate(command, 200),
            exit_code,
            stderr: truncate(stderr.trim(), 500),
        }
    }

    /// Shorthand for [`ProviderError::Unsupported`].
    #[must_use]
    pub const fn unsupported(kind: ProviderKind, operation: &'static str) -> Self {
        Self::Unsupported {
            backend: kind.as_str(),
            operation,
        }
    }

    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connectivity(_) | Self::Timeout { .. } | Self::NotConnected(_) => {
                ErrorKind::Connectivity
            }
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unsupported { .. } | Self::NotRegistered(_) => ErrorKind::Capability,
            Self::InvalidConfig(_) => ErrorKind::Validation,
            Self::Api { status, .. } => match status {
                404 => ErrorKind::NotFound,
                409 => ErrorKind::Conflict,
                400 | 422 => ErrorKind::Validation,
                _ => ErrorKind::Internal,
            },
            Self::Command { .. } | Self::Parse(_) => ErrorKind::Internal,
            Self::Store(e) => e.kind(),
        }
    }

    /// Returns true for transport failures that a reconnect may cure.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        self.kind() == ErrorKind::Connectivity
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

/// A specialized Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Shorten a string for logs and error messages, respecting char boundaries.
#[must_use]
pub fn truncate(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &value[..end])
}
