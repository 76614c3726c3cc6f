//! Error types for the task engine.

use thiserror::Error;
use virtfleet_core::{ErrorKind, InstanceId, ProviderId, TaskId};
use virtfleet_portmap::PortMapError;
use virtfleet_provider::ProviderError;
use virtfleet_store::{StoreError, TaskStatus, TaskType};

/// A result type using `TaskError`.
pub type Result<T> = std::result::Result<T, TaskError>;

/// Errors that can occur in task engine operations.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task was not found.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// The provider was not found.
    #[error("provider not found: {0}")]
    ProviderNotFound(ProviderId),

    /// The instance was not found.
    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// The provider is frozen, expired, or deleted.
    #[error("provider {0} does not accept tasks")]
    ProviderUnavailable(ProviderId),

    /// The provider's health gate is closed to new instances.
    #[error("provider {0} is not accepting new instances")]
    ClaimsBlocked(ProviderId),

    /// The provider runs one task at a time and already has one queued or
    /// running.
    #[error("provider {0} already has a pending or running task")]
    ProviderBusy(ProviderId),

    /// Every execution slot of the provider is taken.
    #[error("provider {provider_id} is at its limit of {limit} running task(s)")]
    ConcurrencyLimit {
        /// The provider.
        provider_id: ProviderId,
        /// Its slot limit.
        limit: usize,
    },

    /// The task is not in a state that allows the operation.
    #[error("cannot {action} task {task_id} in state {status:?}")]
    InvalidTransition {
        /// The task.
        task_id: TaskId,
        /// Its current status.
        status: TaskStatus,
        /// The attempted operation.
        action: &'static str,
    },

    /// The task may only be stopped by an administrator.
    #[error("task {0} cannot be cancelled by its owner")]
    NotForceStoppable(TaskId),

    /// The task needs an instance and none was given.
    #[error("{0} task requires an instance id")]
    MissingInstance(&'static str),

    /// The payload does not match the task type.
    #[error("invalid {task_type:?} payload: {message}")]
    InvalidPayload {
        /// Task type.
        task_type: TaskType,
        /// What is wrong.
        message: String,
    },

    /// Execution observed a cancellation request.
    #[error("task cancelled")]
    Cancelled,

    /// Backend failure.
    #[error("{0}")]
    Provider(#[from] ProviderError),

    /// Port mapping failure.
    #[error("{0}")]
    PortMap(#[from] PortMapError),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// A result could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TaskError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TaskNotFound(_) | Self::ProviderNotFound(_) | Self::InstanceNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::ProviderUnavailable(_)
            | Self::ClaimsBlocked(_)
            | Self::ProviderBusy(_)
            | Self::ConcurrencyLimit { .. }
            | Self::InvalidTransition { .. }
            | Self::NotForceStoppable(_)
            | Self::Cancelled => ErrorKind::Conflict,
            Self::MissingInstance(_) | Self::InvalidPayload { .. } => ErrorKind::Validation,
            Self::Provider(e) => e.kind(),
            Self::PortMap(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// Returns true for conflicts that leave a task queued.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
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
    fn classification() {
        let busy = TaskError::ConcurrencyLimit {
            provider_id: ProviderId::new(1),
            limit: 1,
        };
        assert!(busy.is_conflict());
        assert_eq!(busy.http_status_code(), 409);

        let flaky = TaskError::from(ProviderError::Connectivity("reset".into()));
        assert!(flaky.is_retriable());

        let missing = TaskError::from(StoreError::NotFound);
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }
}
