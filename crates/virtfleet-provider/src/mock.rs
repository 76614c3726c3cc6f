//! In-memory backend for tests.
//!
//! [`MockProvider`] keeps instances and images in maps, records every call,
//! and can be scripted to fail, stall, or report a given health.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use virtfleet_store::{CheckStatus, InstanceKind, ProviderKind};

use crate::capability::{
    Connection, HealthCheck, ImageInfo, ImageManagement, InstanceInfo, InstanceSpec, Lifecycle,
    ProgressFn,
};
use crate::error::{ProviderError, Result};
use crate::health::{CheckOutcome, HealthResult};

#[derive(Debug, Clone)]
enum Failure {
    Command(String),
    Connectivity,
}

/// A scripted backend that never leaves the process.
pub struct MockProvider {
    kind: ProviderKind,
    instance_kinds: Mutex<Vec<InstanceKind>>,
    connected: AtomicBool,
    instances: Mutex<HashMap<String, InstanceInfo>>,
    images: Mutex<Vec<ImageInfo>>,
    created: Mutex<Vec<InstanceSpec>>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, Failure>>,
    ssh_responses: Mutex<Vec<(String, String)>>,
    health: Mutex<Option<HealthResult>>,
    delay: Mutex<Option<Duration>>,
}

impl MockProvider {
    /// Create a mock of the given kind that hosts containers.
    #[must_use]
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            instance_kinds: Mutex::new(vec![InstanceKind::Container]),
            connected: AtomicBool::new(false),
            instances: Mutex::new(HashMap::new()),
            images: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            ssh_responses: Mutex::new(Vec::new()),
            health: Mutex::new(None),
            delay: Mutex::new(None),
        }
    }

    /// Replace the instance kinds this mock accepts.
    pub fn set_instance_kinds(&self, kinds: Vec<InstanceKind>) {
        *self.instance_kinds.lock() = kinds;
    }

    /// Seed an instance.
    pub fn insert_instance(&self, name: &str, kind: InstanceKind, status: &str) {
        self.instances.lock().insert(
            name.to_string(),
            InstanceInfo {
                id: format!("mock-{name}"),
                name: name.to_string(),
                status: status.to_string(),
                image: None,
                ipv4: None,
                kind,
            },
        );
    }

    /// Current state of an instance.
    #[must_use]
    pub fn instance(&self, name: &str) -> Option<InstanceInfo> {
        self.instances.lock().get(name).cloned()
    }

    /// Make `operation` fail with a command error until cleared.
    pub fn fail(&self, operation: &str, message: &str) {
        self.failures
            .lock()
            .insert(operation.to_string(), Failure::Command(message.to_string()));
    }

    /// Make `operation` fail with a connectivity error until cleared.
    pub fn fail_connectivity(&self, operation: &str) {
        self.failures
            .lock()
            .insert(operation.to_string(), Failure::Connectivity);
    }

    /// Remove all scripted failures.
    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Answer SSH commands containing `pattern` with `output`.
    pub fn respond_ssh(&self, pattern: &str, output: &str) {
        self.ssh_responses
            .lock()
            .push((pattern.to_string(), output.to_string()));
    }

    /// Report `result` from health checks instead of a healthy default.
    pub fn set_health(&self, result: HealthResult) {
        *self.health.lock() = Some(result);
    }

    /// Stall every lifecycle call for `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Every call so far, as `"<operation> <argument>"`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Calls starting with `operation`.
    #[must_use]
    pub fn calls_of(&self, operation: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(operation))
            .cloned()
            .collect()
    }

    /// Specs passed to `create_instance`, in order.
    #[must_use]
    pub fn created_specs(&self) -> Vec<InstanceSpec> {
        self.created.lock().clone()
    }

    async fn enter(&self, operation: &str, argument: &str) -> Result<()> {
        self.calls.lock().push(format!("{operation} {argument}"));
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().get(operation).cloned();
        match failure {
            Some(Failure::Command(message)) => Err(ProviderError::command(operation, Some(1), &message)),
            Some(Failure::Connectivity) => Err(ProviderError::Connectivity(format!("{operation}: connection reset"))),
            None => Ok(()),
        }
    }

    fn set_status(&self, name: &str, status: &str) -> Result<()> {
        self.instances
            .lock()
            .get_mut(name)
            .map(|info| info.status = status.to_string())
            .ok_or_else(|| ProviderError::NotFound(format!("instance {name}")))
    }
}

#[async_trait]
impl Connection for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn connect(&self) -> Result<()> {
        self.enter("connect", "").await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.calls.lock().push("disconnect ".to_string());
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ensure_connection(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.connect().await
    }

    async fn execute_ssh_command(&self, command: &str) -> Result<String> {
        self.enter("execute_ssh_command", command).await?;
        Ok(self
            .ssh_responses
            .lock()
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Lifecycle for MockProvider {
    fn supported_instance_types(&self) -> Vec<InstanceKind> {
        self.instance_kinds.lock().clone()
    }

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
        self.enter("list_instances", "").await?;
        let mut list: Vec<_> = self.instances.lock().values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn get_instance(&self, name: &str) -> Result<InstanceInfo> {
        self.enter("get_instance", name).await?;
        self.instance(name)
            .ok_or_else(|| ProviderError::NotFound(format!("instance {name}")))
    }

    async fn create_instance_with_progress(&self, spec: &InstanceSpec, progress: ProgressFn) -> Result<InstanceInfo> {
        if !self.supported_instance_types().contains(&spec.kind) {
            return Err(ProviderError::unsupported(self.kind, "instance kind disabled on this provider"));
        }
        progress(10, "Preparing image");
        self.enter("create_instance", &spec.name).await?;
        self.created.lock().push(spec.clone());
        self.insert_instance(&spec.name, spec.kind, "running");
        progress(100, "Instance ready");
        self.instance(&spec.name)
            .ok_or_else(|| ProviderError::NotFound(format!("instance {}", spec.name)))
    }

    async fn start_instance(&self, name: &str) -> Result<()> {
        self.enter("start_instance", name).await?;
        self.set_status(name, "running")
    }

    async fn stop_instance(&self, name: &str) -> Result<()> {
        self.enter("stop_instance", name).await?;
        self.set_status(name, "stopped")
    }

    async fn restart_instance(&self, name: &str) -> Result<()> {
        self.enter("restart_instance", name).await?;
        self.set_status(name, "running")
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        self.enter("delete_instance", name).await?;
        self.instances.lock().remove(name);
        Ok(())
    }

    async fn set_instance_password(&self, name: &str, _password: &str) -> Result<()> {
        self.enter("set_instance_password", name).await?;
        if self.instance(name).is_none() {
            return Err(ProviderError::NotFound(format!("instance {name}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ImageManagement for MockProvider {
    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        self.enter("list_images", "").await?;
        Ok(self.images.lock().clone())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.enter("pull_image", image).await?;
        let (name, tag) = image
            .split_once(':')
            .map_or((image, None), |(n, t)| (n, Some(t.to_string())));
        self.images.lock().push(ImageInfo {
            id: format!("sha256:{}", hex::encode(&blake3::hash(image.as_bytes()).as_bytes()[..6])),
            name: name.to_string(),
            tag,
            size: "0B".to_string(),
        });
        Ok(())
    }

    async fn delete_image(&self, image: &str) -> Result<()> {
        self.enter("delete_image", image).await?;
        self.images
            .lock()
            .retain(|i| i.id != image && i.name != image);
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for MockProvider {
    async fn health_check(&self, _collect_resources: bool) -> Result<HealthResult> {
        self.enter("health_check", "").await?;
        if let Some(result) = self.health.lock().clone() {
            return Ok(result);
        }
        let ssh = CheckOutcome {
            status: CheckStatus::Online,
            error: None,
            duration_ms: 1,
        };
        Ok(HealthResult::from_checks(
            ssh,
            CheckOutcome::unconfigured(),
            CheckOutcome::unconfigured(),
            Utc::now(),
            Duration::from_millis(1),
        ))
    }
}
