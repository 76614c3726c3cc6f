//! Error taxonomy shared across virtfleet crates.
//!
//! Every crate defines its own error enum; each variant maps onto one
//! [`ErrorKind`] so callers can decide between retrying, surfacing, or
//! choosing another strategy without matching on crate-specific types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of failures across the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport-level failure (reset, refused, timeout, broken pipe, handshake).
    Connectivity,
    /// Provider, instance, task, or port mapping absent.
    NotFound,
    /// Concurrency limit, duplicate in-flight task, port taken, or illegal transition.
    Conflict,
    /// The backend does not support the requested operation.
    Capability,
    /// Malformed input.
    Validation,
    /// Storage, serialization, or other local failure.
    Internal,
}

impl ErrorKind {
    /// Returns true if an operation failing with this kind may succeed on retry.
    #[must_use]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connectivity)
    }

    /// Get the HTTP status code for this kind.
    #[must_use]
    pub const fn http_status_code(self) -> u16 {
        match self {
            Self::Connectivity => 503,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Capability => 422,
            Self::Validation => 400,
            Self::Internal => 500,
        }
    }

    /// Short lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connectivity => "connectivity",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Capability => "capability",
            Self::Validation => "validation",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fragments that identify a transport failure in SSH, HTTP, or OS error text.
const CONNECTIVITY_MARKERS: &[&str] = &[
    "connection refused",
    "connection lost",
    "connection reset",
    "connection timed out",
    "network is unreachable",
    "no route to host",
    "broken pipe",
    "eof",
    "ssh: handshake failed",
    "ssh: unable to authenticate",
    "kex_exchange_identification",
    "operation timed out",
    "could not resolve hostname",
];

/// Returns true if an error message describes a connectivity failure rather
/// than a logical one such as "instance not found".
///
/// Matching is case-insensitive.
#[must_use]
pub fn is_connectivity_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    CONNECTIVITY_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transport_failures() {
        assert!(is_connectivity_message(
            "ssh: connect to host 10.0.0.1 port 22: Connection refused"
        ));
        assert!(is_connectivity_message("write: Broken pipe"));
        assert!(is_connectivity_message("unexpected EOF"));
        assert!(is_connectivity_message("No route to host"));
    }

    #[test]
    fn logical_errors_are_not_connectivity() {
        assert!(!is_connectivity_message(
            "Error: No such container: web-1"
        ));
        assert!(!is_connectivity_message("permission denied"));
    }

    #[test]
    fn only_connectivity_is_retriable() {
        assert!(ErrorKind::Connectivity.is_retriable());
        assert!(!ErrorKind::Conflict.is_retriable());
        assert!(!ErrorKind::Capability.is_retriable());
        assert_eq!(ErrorKind::Conflict.http_status_code(), 409);
    }
}
