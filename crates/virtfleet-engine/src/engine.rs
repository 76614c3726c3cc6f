//! The task engine.
//!
//! ```text
//! pending → running → {completed, failed}
//! pending | running → cancelled
//! ```
//!
//! Task records live in the store; execution slots live in memory. Every
//! transition is a conditional store update, so a late finisher cannot
//! overwrite a task that was cancelled or reclaimed by the timeout sweep.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use virtfleet_core::{InstanceId, ProviderId, TaskId};
use virtfleet_portmap::PortMapper;
use virtfleet_provider::{ProgressFn, ProviderPool};
use virtfleet_store::{Instance, Provider, Store, StoreError, Task, TaskStatus, TaskType};

use crate::config::EngineConfig;
use crate::error::{Result, TaskError};
use crate::executors;
use crate::slots::{CancelToken, RunningSlots};
use crate::types::{is_destructive, requires_instance, CreateTaskRequest};

/// Reason recorded on tasks cancelled by startup reconciliation.
pub const RESTART_CANCEL_REASON: &str = "orchestrator restarted";

/// Creates, gates, executes, and finalizes tasks.
pub struct TaskEngine<S: Store> {
    store: Arc<S>,
    pool: Arc<ProviderPool>,
    ports: Arc<PortMapper<S>>,
    slots: RunningSlots,
    admission: Mutex<()>,
    config: EngineConfig,
    this: Weak<Self>,
}

impl<S: Store + 'static> TaskEngine<S> {
    /// Create a task engine.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        pool: Arc<ProviderPool>,
        ports: Arc<PortMapper<S>>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            pool,
            ports,
            slots: RunningSlots::new(),
            admission: Mutex::new(()),
            config,
            this: this.clone(),
        })
    }

    /// Create with default configuration.
    #[must_use]
    pub fn with_defaults(store: Arc<S>, pool: Arc<ProviderPool>, ports: Arc<PortMapper<S>>) -> Arc<Self> {
        Self::new(store, pool, ports, EngineConfig::default())
    }

    /// Get a reference to the store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Backend connections.
    #[must_use]
    pub fn pool(&self) -> &ProviderPool {
        &self.pool
    }

    /// Port mapping service.
    #[must_use]
    pub fn ports(&self) -> &PortMapper<S> {
        &self.ports
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execution slots held on a provider by this process.
    #[must_use]
    pub fn running_count(&self, provider_id: ProviderId) -> usize {
        self.slots.held(provider_id)
    }

    fn load_task(&self, task_id: &TaskId) -> Result<Task> {
        self.store
            .get_task(task_id)?
            .ok_or(TaskError::TaskNotFound(*task_id))
    }

    pub(crate) fn load_provider(&self, provider_id: ProviderId) -> Result<Provider> {
        self.store
            .get_provider(provider_id)?
            .ok_or(TaskError::ProviderNotFound(provider_id))
    }

    pub(crate) fn load_instance(&self, instance_id: InstanceId) -> Result<Instance> {
        self.store
            .get_instance(instance_id)?
            .ok_or(TaskError::InstanceNotFound(instance_id))
    }

    /// Get a task by ID.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::TaskNotFound` if the task doesn't exist.
    pub fn get_task(&self, task_id: &TaskId) -> Result<Task> {
        self.load_task(task_id)
    }

    fn resolve_timeout(&self, task_type: TaskType, requested: Option<u64>) -> u64 {
        requested
            .filter(|secs| *secs > 0)
            .or(self.config.default_timeout_secs)
            .unwrap_or_else(|| task_type.default_timeout_secs())
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Queue a task and hand it to the dispatcher.
    ///
    /// Admin-issued destructive tasks (`adminOperation: true` in the payload)
    /// are not force-stoppable by the owning user.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::ProviderUnavailable` for frozen, expired, or
    /// deleted providers, `TaskError::ClaimsBlocked` for a create on a
    /// provider whose health gate is closed, and `TaskError::ProviderBusy`
    /// if the provider runs one task at a time and already has one pending
    /// or running.
    ///
    /// # Panics
    ///
    /// Dispatching spawns onto the current Tokio runtime and panics outside
    /// one.
    pub fn create_task(&self, request: CreateTaskRequest) -> Result<Task> {
        if requires_instance(request.task_type) && request.instance_id.is_none() {
            return Err(TaskError::MissingInstance(request.task_type.as_str()));
        }
        let force_stoppable = !(request.is_admin_operation() && is_destructive(request.task_type));
        let timeout_secs = self.resolve_timeout(request.task_type, request.timeout_secs);

        let task = {
            let _admission = self.admission.lock();
            let provider = self.load_provider(request.provider_id)?;
            if !provider.accepts_tasks(Utc::now()) {
                return Err(TaskError::ProviderUnavailable(provider.id));
            }
            if request.task_type == TaskType::Create && !provider.allow_claim {
                return Err(TaskError::ClaimsBlocked(provider.id));
            }
            if !provider.allow_concurrent_tasks
                && self
                    .store
                    .list_tasks_by_provider(provider.id)?
                    .iter()
                    .any(|t| t.status.is_active())
            {
                return Err(TaskError::ProviderBusy(provider.id));
            }

            let mut task = Task::new(
                provider.id,
                request.instance_id,
                request.task_type,
                request.payload,
                timeout_secs,
            );
            task.force_stoppable = force_stoppable;
            self.store.put_task(&task)?;
            task
        };

        info!(
            task_id = %task.id,
            provider_id = %task.provider_id,
            task_type = task.task_type.as_str(),
            timeout_secs,
            "Created task"
        );

        self.dispatch(task.provider_id);
        Ok(task)
    }

    /// Move a pending task to running and spawn its execution.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::ConcurrencyLimit` if the provider's slots are all
    /// held, or `TaskError::InvalidTransition` if the task is not pending.
    ///
    /// # Panics
    ///
    /// Panics outside a Tokio runtime.
    pub fn start_task(&self, task_id: &TaskId) -> Result<Task> {
        let task = self.load_task(task_id)?;
        if task.status != TaskStatus::Pending {
            return Err(TaskError::InvalidTransition {
                task_id: *task_id,
                status: task.status,
                action: "start",
            });
        }
        let provider = self.load_provider(task.provider_id)?;
        let token = self
            .slots
            .acquire(provider.id, *task_id, provider.task_slot_limit())?;

        let now = Utc::now();
        let executor_id = &self.config.executor_id;
        let started = self.store.update_task(task_id, &mut |t| {
            if t.status != TaskStatus::Pending {
                return false;
            }
            t.status = TaskStatus::Running;
            t.started_at = Some(now);
            t.executor_id = Some(executor_id.clone());
            t.status_message = Some("Started".to_string());
            t.updated_at = now;
            true
        });
        let started = match started {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.slots.release_token(&token);
                let current = self.load_task(task_id)?;
                return Err(TaskError::InvalidTransition {
                    task_id: *task_id,
                    status: current.status,
                    action: "start",
                });
            }
            Err(e) => {
                self.slots.release_token(&token);
                return Err(e.into());
            }
        };

        info!(
            task_id = %task_id,
            provider_id = %provider.id,
            task_type = started.task_type.as_str(),
            "Started task"
        );

        self.spawn(started.clone(), token);
        Ok(started)
    }

    fn spawn(&self, task: Task, token: CancelToken) {
        let Some(engine) = self.this.upgrade() else {
            warn!(task_id = %task.id, "Engine dropped before execution");
            self.slots.release_token(&token);
            return;
        };
        tokio::spawn(async move { engine.execute(task, token).await });
    }

    async fn execute(self: Arc<Self>, task: Task, token: CancelToken) {
        let outcome = executors::run(&self, &task, &token).await;
        let finished = match outcome {
            Ok(result) => self.finish_task(&task.id, true, None, result),
            Err(TaskError::Cancelled) => {
                debug!(task_id = %task.id, "Execution abandoned after cancellation");
                self.slots.release_token(&token);
                self.dispatch(task.provider_id);
                return;
            }
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    provider_id = %task.provider_id,
                    task_type = task.task_type.as_str(),
                    error = %e,
                    "Task failed"
                );
                self.finish_task(&task.id, false, Some(e.to_string()), None)
            }
        };
        if let Err(e) = finished {
            error!(task_id = %task.id, error = %e, "Failed to record task outcome");
        }
    }

    /// Cancel a pending or running task.
    ///
    /// Signals the execution, persists `cancelled`, and frees the slot.
    /// Cancelling an already cancelled task returns it unchanged.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::InvalidTransition` for completed or failed tasks.
    pub fn cancel_task(&self, task_id: &TaskId, reason: &str) -> Result<Task> {
        let task = self.load_task(task_id)?;
        match task.status {
            TaskStatus::Cancelled => return Ok(task),
            TaskStatus::Completed | TaskStatus::Failed => {
                return Err(TaskError::InvalidTransition {
                    task_id: *task_id,
                    status: task.status,
                    action: "cancel",
                });
            }
            TaskStatus::Pending | TaskStatus::Running => {}
        }

        self.slots.cancel(task.provider_id, task_id);

        let now = Utc::now();
        let updated = self.store.update_task(task_id, &mut |t| {
            if t.status.is_terminal() {
                return false;
            }
            t.status = TaskStatus::Cancelled;
            t.cancelled_at = Some(now);
            t.cancel_reason = Some(reason.to_string());
            t.status_message = Some("Cancelled".to_string());
            t.updated_at = now;
            true
        })?;
        self.slots.release(task.provider_id, task_id);

        let task = match updated {
            Some(task) => {
                info!(task_id = %task_id, provider_id = %task.provider_id, reason, "Cancelled task");
                task
            }
            None => self.load_task(task_id)?,
        };

        self.dispatch(task.provider_id);
        Ok(task)
    }

    /// Cancel on behalf of the task's owner.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::NotForceStoppable` for admin-issued destructive
    /// tasks, otherwise as [`Self::cancel_task`].
    pub fn cancel_task_by_user(&self, task_id: &TaskId) -> Result<Task> {
        let task = self.load_task(task_id)?;
        if !task.force_stoppable {
            return Err(TaskError::NotForceStoppable(*task_id));
        }
        self.cancel_task(task_id, "cancelled by user")
    }

    /// Record the outcome of a running task and free its slot.
    ///
    /// Success forces progress to 100. A task that is already terminal is
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::InvalidTransition` if the task never started.
    pub fn finish_task(
        &self,
        task_id: &TaskId,
        success: bool,
        error_message: Option<String>,
        result_data: Option<serde_json::Value>,
    ) -> Result<Task> {
        let now = Utc::now();
        let updated = self.store.update_task(task_id, &mut |t| {
            if t.status != TaskStatus::Running {
                return false;
            }
            if success {
                t.status = TaskStatus::Completed;
                t.progress = 100;
                t.status_message = Some("Completed".to_string());
            } else {
                t.status = TaskStatus::Failed;
                t.status_message = Some("Failed".to_string());
            }
            t.error_message.clone_from(&error_message);
            t.result_data.clone_from(&result_data);
            t.completed_at = Some(now);
            t.updated_at = now;
            true
        });
        let updated = match updated {
            Ok(updated) => updated,
            Err(StoreError::NotFound) => return Err(TaskError::TaskNotFound(*task_id)),
            Err(e) => return Err(e.into()),
        };

        let task = match updated {
            Some(task) => {
                self.slots.release(task.provider_id, task_id);
                info!(
                    task_id = %task_id,
                    provider_id = %task.provider_id,
                    status = ?task.status,
                    "Finished task"
                );
                task
            }
            None => {
                let current = self.load_task(task_id)?;
                if current.status == TaskStatus::Pending {
                    return Err(TaskError::InvalidTransition {
                        task_id: *task_id,
                        status: current.status,
                        action: "finish",
                    });
                }
                debug!(task_id = %task_id, status = ?current.status, "Task already terminal, outcome dropped");
                current
            }
        };

        self.dispatch(task.provider_id);
        Ok(task)
    }

    /// Record progress on a running task, clamped to 0-100.
    ///
    /// Returns `None` if the task is not running.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::TaskNotFound` if the task doesn't exist.
    pub fn update_progress(&self, task_id: &TaskId, progress: i64, message: Option<&str>) -> Result<Option<Task>> {
        let progress = u8::try_from(progress.clamp(0, 100)).unwrap_or(100);
        let now = Utc::now();
        match self.store.update_task(task_id, &mut |t| {
            if t.status != TaskStatus::Running {
                return false;
            }
            t.progress = progress;
            if let Some(message) = message {
                t.status_message = Some(message.to_string());
                t.log_output
                    .push_str(&format!("[{}] {message}\n", now.format("%H:%M:%S")));
            }
            t.updated_at = now;
            true
        }) {
            Ok(updated) => Ok(updated),
            Err(StoreError::NotFound) => Err(TaskError::TaskNotFound(*task_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn progress_reporter(&self, task_id: TaskId, base: u8, span: u8) -> ProgressFn {
        let engine = self.this.clone();
        Arc::new(move |percent, message| {
            let Some(engine) = engine.upgrade() else {
                return;
            };
            let scaled = i64::from(base) + i64::from(percent.min(100)) * i64::from(span) / 100;
            if let Err(e) = engine.update_progress(&task_id, scaled, Some(message)) {
                debug!(task_id = %task_id, error = %e, "Progress update dropped");
            }
        })
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Fail every running task past its deadline and free its slot.
    ///
    /// The worker, if still blocked, is signalled but not awaited; whatever
    /// it reports later is dropped. Returns the reclaimed task IDs.
    ///
    /// # Errors
    ///
    /// Returns an error if running tasks cannot be listed.
    pub fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>> {
        let mut reclaimed = Vec::new();
        let mut providers = BTreeSet::new();

        for task in self.store.list_tasks_by_status(TaskStatus::Running)? {
            if !task.is_overdue(now) {
                continue;
            }
            let message = format!("task timed out after {}s", task.timeout_secs);
            let updated = self.store.update_task(&task.id, &mut |t| {
                if !t.is_overdue(now) {
                    return false;
                }
                t.status = TaskStatus::Failed;
                t.error_message = Some(message.clone());
                t.status_message = Some("Timed out".to_string());
                t.completed_at = Some(now);
                t.updated_at = now;
                true
            });
            self.slots.cancel(task.provider_id, &task.id);
            self.slots.release(task.provider_id, &task.id);

            match updated {
                Ok(Some(_)) => {
                    warn!(
                        task_id = %task.id,
                        provider_id = %task.provider_id,
                        timeout_secs = task.timeout_secs,
                        "Task timed out"
                    );
                    reclaimed.push(task.id);
                    providers.insert(task.provider_id);
                }
                Ok(None) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to time out task"),
            }
        }

        for provider_id in providers {
            self.dispatch(provider_id);
        }
        Ok(reclaimed)
    }

    /// Cancel every task left pending or running by a previous process.
    ///
    /// Call once at startup, before the dispatcher runs.
    ///
    /// # Errors
    ///
    /// Returns an error if tasks cannot be listed.
    pub fn reconcile_on_startup(&self) -> Result<usize> {
        let now = Utc::now();
        let mut cancelled = 0;
        for status in [TaskStatus::Pending, TaskStatus::Running] {
            for task in self.store.list_tasks_by_status(status)? {
                let updated = self.store.update_task(&task.id, &mut |t| {
                    if t.status.is_terminal() {
                        return false;
                    }
                    t.status = TaskStatus::Cancelled;
                    t.cancelled_at = Some(now);
                    t.cancel_reason = Some(RESTART_CANCEL_REASON.to_string());
                    t.updated_at = now;
                    true
                })?;
                if updated.is_some() {
                    cancelled += 1;
                }
            }
        }
        if cancelled > 0 {
            info!(count = cancelled, "Cancelled tasks interrupted by restart");
        }
        Ok(cancelled)
    }

    /// Delete terminal tasks that finished more than `older_than` ago.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn cleanup_old_tasks(&self, older_than: Duration) -> Result<usize> {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let deleted = self.store.delete_terminal_tasks_before(cutoff)?;
        if deleted > 0 {
            info!(count = deleted, cutoff = %cutoff, "Deleted old tasks");
        }
        Ok(deleted)
    }

    /// Have the next successful SSH health check re-harvest the provider's
    /// resource facts.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::ProviderNotFound` if the provider doesn't exist.
    pub fn request_resource_resync(&self, provider_id: ProviderId) -> Result<()> {
        match self
            .store
            .update_provider(provider_id, &mut |p| p.resource_synced = false)
        {
            Ok(_) => {
                debug!(provider_id = %provider_id, "Resource re-sync requested");
                Ok(())
            }
            Err(StoreError::NotFound) => Err(TaskError::ProviderNotFound(provider_id)),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Start pending tasks of a provider, oldest first, until its slots are
    /// full.
    pub fn dispatch(&self, provider_id: ProviderId) {
        if !self.config.auto_dispatch {
            return;
        }
        let tasks = match self.store.list_tasks_by_provider(provider_id) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(provider_id = %provider_id, error = %e, "Dispatch could not list tasks");
                return;
            }
        };
        for task in tasks.iter().filter(|t| t.status == TaskStatus::Pending) {
            match self.start_task(&task.id) {
                Ok(_) => {}
                Err(TaskError::ConcurrencyLimit { .. }) => {
                    debug!(provider_id = %provider_id, task_id = %task.id, "Provider busy, task stays queued");
                    return;
                }
                Err(TaskError::InvalidTransition { .. }) => {
                    debug!(task_id = %task.id, "Task already taken by another dispatcher");
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "Dispatch failed to start task"),
            }
        }
    }

    /// Dispatch every provider.
    ///
    /// # Errors
    ///
    /// Returns an error if providers cannot be listed.
    pub fn dispatch_all(&self) -> Result<()> {
        for provider in self.store.list_providers()? {
            self.dispatch(provider.id);
        }
        Ok(())
    }
}
