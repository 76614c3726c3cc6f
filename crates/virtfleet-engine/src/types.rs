//! Request, payload, and result types for the task engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use virtfleet_core::{InstanceId, ProviderId};
use virtfleet_store::TaskType;

/// Request to create a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    /// Provider the task runs against.
    pub provider_id: ProviderId,
    /// Target instance.
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    /// Operation.
    pub task_type: TaskType,
    /// Executor-specific input.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Allotted run time; the per-type default applies when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CreateTaskRequest {
    /// A request with an empty payload and the default timeout.
    #[must_use]
    pub fn new(provider_id: ProviderId, instance_id: Option<InstanceId>, task_type: TaskType) -> Self {
        Self {
            provider_id,
            instance_id,
            task_type,
            payload: serde_json::Value::Null,
            timeout_secs: None,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Returns true if an administrator issued the task on a user's behalf.
    #[must_use]
    pub fn is_admin_operation(&self) -> bool {
        self.payload
            .get("adminOperation")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// Payload of a create task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstancePayload {
    /// Instance record to materialize.
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    /// Provider hosting it.
    #[serde(default)]
    pub provider_id: Option<ProviderId>,
    /// Issued by an administrator.
    #[serde(default)]
    pub admin_operation: bool,
}

/// Result of a reset-password task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordReset {
    /// The new root password.
    pub new_password: String,
    /// When it was set.
    pub reset_time: DateTime<Utc>,
}

/// Whether a task of this type destroys or interrupts a user's workload.
#[must_use]
pub const fn is_destructive(task_type: TaskType) -> bool {
    matches!(
        task_type,
        TaskType::Stop | TaskType::Restart | TaskType::Delete | TaskType::ResetPassword
    )
}

/// Whether a task of this type needs `instance_id` at creation.
#[must_use]
pub const fn requires_instance(task_type: TaskType) -> bool {
    !matches!(
        task_type,
        TaskType::CreatePortMapping | TaskType::DeletePortMapping
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn admin_flag_comes_from_payload() {
        let request = CreateTaskRequest::new(ProviderId::new(1), Some(InstanceId::new(42)), TaskType::Delete)
            .with_payload(json!({"adminOperation": true}));
        assert!(request.is_admin_operation());

        let plain = CreateTaskRequest::new(ProviderId::new(1), None, TaskType::CreatePortMapping);
        assert!(!plain.is_admin_operation());
    }

    #[test]
    fn create_payload_wire_names() {
        let payload: CreateInstancePayload =
            serde_json::from_value(json!({"instanceId": 42, "providerId": 1, "adminOperation": false})).unwrap();
        assert_eq!(payload.instance_id, Some(InstanceId::new(42)));
        assert_eq!(payload.provider_id, Some(ProviderId::new(1)));
    }

    #[test]
    fn password_reset_wire_names() {
        let reset = PasswordReset {
            new_password: "a1b2c3d4e5f6".into(),
            reset_time: Utc::now(),
        };
        let value = serde_json::to_value(&reset).unwrap();
        assert!(value.get("newPassword").is_some());
        assert!(value.get("resetTime").is_some());
    }
}
