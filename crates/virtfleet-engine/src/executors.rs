//! Executors, one per task type.
//!
//! Each executor returns the task's result data. Instance status follows
//! the operation: a transitional status while it runs, the settled status
//! on success, the previous status on failure. Create is the exception and
//! marks the instance failed, since there is nothing to go back to.

use chrono::Utc;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use virtfleet_core::InstanceId;
use virtfleet_portmap::{PortMappingDeletion, PortMappingRequest};
use virtfleet_provider::{InstanceSpec, ProviderError};
use virtfleet_store::{
    Instance, InstanceStatus, PortMapping, Provider, Store, Task, TaskType, UsageDelta,
};

use crate::engine::TaskEngine;
use crate::error::{Result, TaskError};
use crate::slots::CancelToken;
use crate::types::{CreateInstancePayload, PasswordReset};

/// Length of generated root passwords.
pub const PASSWORD_LEN: usize = 12;

pub(crate) async fn run<S: Store + 'static>(
    engine: &TaskEngine<S>,
    task: &Task,
    cancel: &CancelToken,
) -> Result<Option<Value>> {
    cancel.checkpoint()?;
    match task.task_type {
        TaskType::Create => create(engine, task, cancel).await,
        TaskType::Start => power(engine, task, cancel, Power::Start).await,
        TaskType::Stop => power(engine, task, cancel, Power::Stop).await,
        TaskType::Restart => power(engine, task, cancel, Power::Restart).await,
        TaskType::Delete => delete(engine, task, cancel).await,
        TaskType::ResetPassword => reset_password(engine, task, cancel).await,
        TaskType::CreatePortMapping => create_port_mapping(engine, task).await,
        TaskType::DeletePortMapping => delete_port_mapping(engine, task).await,
    }
}

fn parse_payload<T: DeserializeOwned>(task: &Task, payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| TaskError::InvalidPayload {
        task_type: task.task_type,
        message: e.to_string(),
    })
}

fn target<S: Store + 'static>(engine: &TaskEngine<S>, task: &Task) -> Result<(Instance, Provider)> {
    let instance_id = task
        .instance_id
        .ok_or(TaskError::MissingInstance(task.task_type.as_str()))?;
    let instance = engine.load_instance(instance_id)?;
    let provider = engine.load_provider(instance.provider_id)?;
    Ok((instance, provider))
}

fn restore_status<S: Store + 'static>(engine: &TaskEngine<S>, instance_id: InstanceId, status: InstanceStatus) {
    if let Err(e) = engine.store().update_instance_status(instance_id, status) {
        warn!(instance_id = %instance_id, error = %e, "Failed to restore instance status");
    }
}

// =============================================================================
// create
// =============================================================================

async fn create<S: Store + 'static>(
    engine: &TaskEngine<S>,
    task: &Task,
    cancel: &CancelToken,
) -> Result<Option<Value>> {
    let payload: CreateInstancePayload = if task.payload.is_null() {
        CreateInstancePayload::default()
    } else {
        parse_payload(task, task.payload.clone())?
    };
    let instance_id = task
        .instance_id
        .or(payload.instance_id)
        .ok_or(TaskError::MissingInstance("create"))?;
    let instance = engine.load_instance(instance_id)?;
    let provider = engine.load_provider(instance.provider_id)?;

    engine.update_progress(&task.id, 5, Some("Allocating ports"))?;
    let mappings = match engine.ports().allocate_defaults(&provider, &instance) {
        Ok(mappings) => mappings,
        Err(e) => {
            restore_status(engine, instance_id, InstanceStatus::Failed);
            return Err(e.into());
        }
    };

    let outcome = materialize(engine, task, cancel, &provider, instance_id, &mappings).await;
    if outcome.is_err() {
        abandon_create(engine, &provider, &instance).await;
    }
    outcome
}

async fn materialize<S: Store + 'static>(
    engine: &TaskEngine<S>,
    task: &Task,
    cancel: &CancelToken,
    provider: &Provider,
    instance_id: InstanceId,
    mappings: &[PortMapping],
) -> Result<Option<Value>> {
    cancel.checkpoint()?;
    let instance = engine.load_instance(instance_id)?;
    let published: &[PortMapping] = if engine.ports().supports_dynamic(provider)? {
        &[]
    } else {
        mappings
    };
    let spec = InstanceSpec::from_instance(&instance, published);

    let info = cancel
        .interruptible(async {
            let backend = engine.pool().connected(provider).await?;
            Ok(backend
                .create_instance_with_progress(&spec, engine.progress_reporter(task.id, 10, 70))
                .await?)
        })
        .await?;
    cancel.checkpoint()?;

    engine.update_progress(&task.id, 85, Some("Configuring port mappings"))?;
    engine.ports().apply(provider, &instance, mappings).await?;

    let public_ip = provider.public_ip().to_string();
    let ready = engine.store().update_instance(instance_id, &mut |i| {
        i.status = InstanceStatus::Running;
        if let Some(ip) = &info.ipv4 {
            i.private_ip = Some(ip.clone());
        }
        if i.public_ip.is_none() {
            i.public_ip = Some(public_ip.clone());
        }
        i.updated_at = Utc::now();
    })?;
    engine
        .store()
        .adjust_provider_usage(provider.id, UsageDelta::for_instance(&ready))?;

    info!(
        instance_id = %ready.id,
        provider_id = %provider.id,
        name = %ready.name,
        ssh_port = ?ready.ssh_port,
        "Instance created"
    );

    Ok(Some(json!({
        "instanceId": ready.id,
        "name": ready.name,
        "status": ready.status,
        "sshPort": ready.ssh_port,
        "privateIp": ready.private_ip,
        "publicIp": ready.public_ip,
    })))
}

async fn abandon_create<S: Store + 'static>(engine: &TaskEngine<S>, provider: &Provider, instance: &Instance) {
    match engine.pool().connected(provider).await {
        Ok(backend) => match backend.delete_instance(&instance.name).await {
            Ok(()) | Err(ProviderError::NotFound(_)) => {}
            Err(e) => warn!(instance_id = %instance.id, error = %e, "Failed to remove partial instance"),
        },
        Err(e) => debug!(instance_id = %instance.id, error = %e, "Backend unreachable for create cleanup"),
    }
    if let Err(e) = engine.store().release_instance_ports(instance.id) {
        warn!(instance_id = %instance.id, error = %e, "Failed to release ports of failed instance");
    }
    restore_status(engine, instance.id, InstanceStatus::Failed);
}

// =============================================================================
// start / stop / restart
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Power {
    Start,
    Stop,
    Restart,
}

impl Power {
    const fn transitional(self) -> InstanceStatus {
        match self {
            Self::Start => InstanceStatus::Starting,
            Self::Stop => InstanceStatus::Stopping,
            Self::Restart => InstanceStatus::Restarting,
        }
    }

    const fn settled(self) -> InstanceStatus {
        match self {
            Self::Start | Self::Restart => InstanceStatus::Running,
            Self::Stop => InstanceStatus::Stopped,
        }
    }
}

async fn power<S: Store + 'static>(
    engine: &TaskEngine<S>,
    task: &Task,
    cancel: &CancelToken,
    op: Power,
) -> Result<Option<Value>> {
    let (instance, provider) = target(engine, task)?;
    let previous = instance.status;
    engine
        .store()
        .update_instance_status(instance.id, op.transitional())?;

    let outcome: Result<()> = cancel
        .interruptible(async {
            let backend = engine.pool().connected(&provider).await?;
            match op {
                Power::Start => backend.start_instance(&instance.name).await?,
                Power::Stop => backend.stop_instance(&instance.name).await?,
                Power::Restart => backend.restart_instance(&instance.name).await?,
            }
            Ok(())
        })
        .await;

    if let Err(e) = outcome {
        restore_status(engine, instance.id, previous);
        return Err(e);
    }
    let settled = engine
        .store()
        .update_instance_status(instance.id, op.settled())?;
    info!(instance_id = %instance.id, operation = ?op, "Instance power operation done");
    Ok(Some(json!({ "instanceId": settled.id, "status": settled.status })))
}

// =============================================================================
// delete
// =============================================================================

async fn delete<S: Store + 'static>(engine: &TaskEngine<S>, task: &Task, cancel: &CancelToken) -> Result<Option<Value>> {
    let (instance, provider) = target(engine, task)?;
    let previous = instance.status;
    engine
        .store()
        .update_instance_status(instance.id, InstanceStatus::Deleting)?;

    let removed: Result<()> = cancel
        .interruptible(async {
            let backend = engine.pool().connected(&provider).await?;
            match backend.delete_instance(&instance.name).await {
                Ok(()) => Ok(()),
                Err(ProviderError::NotFound(_)) => {
                    debug!(instance_id = %instance.id, "Instance already absent on backend");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        })
        .await;
    if let Err(e) = removed {
        restore_status(engine, instance.id, previous);
        return Err(e);
    }

    if let Err(e) = engine.ports().teardown(&provider, &instance).await {
        warn!(instance_id = %instance.id, error = %e, "Port mapping teardown failed");
    }

    let released = engine
        .store()
        .purge_instance(instance.id, UsageDelta::released_by(&instance))?;

    info!(
        instance_id = %instance.id,
        provider_id = %provider.id,
        released_ports = released.len(),
        "Instance deleted"
    );
    Ok(Some(json!({ "instanceId": instance.id, "releasedPorts": released.len() })))
}

// =============================================================================
// reset-password
// =============================================================================

/// Generate a root password: a lowercase letter, then lowercase letters and
/// digits, with at least one digit.
pub fn generate_password<R: Rng>(rng: &mut R) -> String {
    const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    const ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

    let mut chars = Vec::with_capacity(PASSWORD_LEN);
    chars.push(LOWER[rng.gen_range(0..LOWER.len())]);
    for _ in 1..PASSWORD_LEN {
        chars.push(ALNUM[rng.gen_range(0..ALNUM.len())]);
    }
    if !chars.iter().any(u8::is_ascii_digit) {
        let at = rng.gen_range(1..PASSWORD_LEN);
        chars[at] = b'0' + rng.gen_range(0..10u8);
    }
    chars.into_iter().map(char::from).collect()
}

async fn reset_password<S: Store + 'static>(
    engine: &TaskEngine<S>,
    task: &Task,
    cancel: &CancelToken,
) -> Result<Option<Value>> {
    let (instance, provider) = target(engine, task)?;
    let previous = instance.status;
    engine
        .store()
        .update_instance_status(instance.id, InstanceStatus::Resetting)?;

    let password = generate_password(&mut rand::thread_rng());
    let outcome: Result<()> = cancel
        .interruptible(async {
            let backend = engine.pool().connected(&provider).await?;
            backend.set_instance_password(&instance.name, &password).await?;
            Ok(())
        })
        .await;
    restore_status(engine, instance.id, previous);
    outcome?;

    info!(instance_id = %instance.id, "Root password reset");
    let reset = PasswordReset {
        new_password: password,
        reset_time: Utc::now(),
    };
    Ok(Some(serde_json::to_value(reset)?))
}

// =============================================================================
// port mappings
// =============================================================================

async fn create_port_mapping<S: Store + 'static>(engine: &TaskEngine<S>, task: &Task) -> Result<Option<Value>> {
    let mut payload = task.payload.clone();
    if let (Some(instance_id), Some(fields)) = (task.instance_id, payload.as_object_mut()) {
        fields
            .entry("instanceId")
            .or_insert_with(|| json!(instance_id));
    }
    let request: PortMappingRequest = parse_payload(task, payload)?;
    let view = engine.ports().create_mapping(&request).await?;
    Ok(Some(serde_json::to_value(view)?))
}

async fn delete_port_mapping<S: Store + 'static>(engine: &TaskEngine<S>, task: &Task) -> Result<Option<Value>> {
    let deletion: PortMappingDeletion = parse_payload(task, task.payload.clone())?;
    let removed = engine.ports().delete_mapping(&deletion.port_id).await?;
    Ok(Some(json!({
        "portId": removed.id,
        "instanceId": removed.instance_id,
        "hostPort": removed.host_port,
        "guestPort": removed.guest_port,
        "protocol": removed.protocol,
    })))
}
