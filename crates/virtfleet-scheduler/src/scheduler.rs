//! The periodic loops.
//!
//! Three loops run side by side, each stopping when the shutdown signal
//! flips: provider health, maintenance (with the task timeout sweep on its
//! own shorter interval), and traffic metering. A failing step is logged and
//! the loop carries on with the next one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};
use virtfleet_core::InstanceId;
use virtfleet_engine::TaskEngine;
use virtfleet_provider::{CheckOutcome, HealthResult, ProviderError};
use virtfleet_store::{CheckStatus, Instance, Provider, Store, StoreError, TaskStatus, UsageDelta};

use crate::admission::{apply_health, is_long_inactive};
use crate::collaborators::{NoopSessionPruner, NoopTrafficSync, SessionPruner, TrafficSync};
use crate::config::SchedulerConfig;
use crate::error::Result;

/// Outcome of one health round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Providers checked.
    pub checked: usize,
    /// Providers that stopped accepting claims.
    pub claims_blocked: usize,
    /// Providers that accept claims again.
    pub claims_allowed: usize,
}

/// Outcome of one maintenance round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Expired sessions and blacklist entries removed.
    pub pruned_sessions: usize,
    /// Expired instances torn down.
    pub expired_instances: usize,
    /// Long-inactive providers that stopped accepting claims.
    pub demoted_providers: usize,
    /// Old terminal tasks deleted.
    pub deleted_tasks: usize,
}

/// Drives health checks, maintenance, and traffic sync.
pub struct Scheduler<S: Store> {
    engine: Arc<TaskEngine<S>>,
    config: SchedulerConfig,
    traffic: Arc<dyn TrafficSync>,
    sessions: Arc<dyn SessionPruner>,
}

impl<S: Store + 'static> Scheduler<S> {
    /// Create a scheduler with no-op collaborators.
    #[must_use]
    pub fn new(engine: Arc<TaskEngine<S>>, config: SchedulerConfig) -> Self {
        Self {
            engine,
            config,
            traffic: Arc::new(NoopTrafficSync),
            sessions: Arc::new(NoopSessionPruner),
        }
    }

    /// Use `traffic` for the traffic loop.
    #[must_use]
    pub fn with_traffic_sync(mut self, traffic: Arc<dyn TrafficSync>) -> Self {
        self.traffic = traffic;
        self
    }

    /// Use `sessions` for session pruning.
    #[must_use]
    pub fn with_session_pruner(mut self, sessions: Arc<dyn SessionPruner>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Get the task engine.
    #[must_use]
    pub fn engine(&self) -> &TaskEngine<S> {
        &self.engine
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // =========================================================================
    // Loops
    // =========================================================================

    /// Start the loops. Each stops when `shutdown` becomes true or its
    /// sender is dropped.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            health_interval_secs = self.config.health_interval_secs,
            maintenance_interval_secs = self.config.maintenance_interval_secs,
            timeout_sweep_interval_secs = self.config.timeout_sweep_interval_secs,
            traffic_interval_secs = self.config.traffic_interval_secs,
            "Starting scheduler loops"
        );
        vec![
            tokio::spawn(Arc::clone(&self).health_loop(shutdown.clone())),
            tokio::spawn(Arc::clone(&self).maintenance_loop(shutdown.clone())),
            tokio::spawn(self.traffic_loop(shutdown)),
        ]
    }

    async fn health_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        // The first tick fires immediately.
        let mut ticker = interval(self.config.health_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_health_round().await {
                        warn!(error = %e, "Health round failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Health loop stopped");
    }

    async fn maintenance_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let start = tokio::time::Instant::now();
        let mut sweep = interval_at(
            start + self.config.timeout_sweep_interval(),
            self.config.timeout_sweep_interval(),
        );
        let mut maintenance = interval_at(
            start + self.config.maintenance_interval(),
            self.config.maintenance_interval(),
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = sweep.tick() => {
                    if let Err(e) = self.run_timeout_sweep() {
                        warn!(error = %e, "Timeout sweep failed");
                    }
                }
                _ = maintenance.tick() => {
                    self.run_maintenance_round().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Maintenance loop stopped");
    }

    async fn traffic_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.traffic_interval();
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => self.run_traffic_round().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("Traffic loop stopped");
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Check every provider that can take work and persist the results.
    ///
    /// Frozen, expired, and deleted providers are skipped. A provider whose
    /// backend cannot even be built is recorded with an offline SSH check.
    ///
    /// # Errors
    ///
    /// Returns an error if providers cannot be listed.
    pub async fn run_health_round(&self) -> Result<HealthReport> {
        let now = Utc::now();
        let providers: Vec<Provider> = self
            .engine
            .store()
            .list_providers()?
            .into_iter()
            .filter(|p| p.accepts_tasks(now))
            .collect();

        let changes: Vec<Option<bool>> = stream::iter(providers)
            .map(|provider| self.check_provider(provider))
            .buffer_unordered(self.config.health_concurrency.max(1))
            .collect()
            .await;

        let report = HealthReport {
            checked: changes.len(),
            claims_blocked: changes.iter().filter(|c| **c == Some(false)).count(),
            claims_allowed: changes.iter().filter(|c| **c == Some(true)).count(),
        };
        debug!(
            checked = report.checked,
            claims_blocked = report.claims_blocked,
            claims_allowed = report.claims_allowed,
            "Health round complete"
        );
        Ok(report)
    }

    async fn check_provider(&self, provider: Provider) -> Option<bool> {
        let started = Instant::now();
        let checked = match self.engine.pool().backend(&provider) {
            Ok(backend) => backend.health_check(!provider.resource_synced).await,
            Err(e) => Err(e),
        };
        let result = checked.unwrap_or_else(|e| unreachable_result(&e, started));

        if !result.errors.is_empty() {
            debug!(provider_id = %provider.id, errors = ?result.errors, "Health check reported errors");
        }

        let mut change = None;
        let persisted = self
            .engine
            .store()
            .update_provider(provider.id, &mut |p| change = apply_health(p, &result));
        match persisted {
            Ok(updated) => match change {
                Some(false) => warn!(
                    provider_id = %provider.id,
                    status = ?updated.status,
                    "Provider degraded, new instances blocked"
                ),
                Some(true) => info!(provider_id = %provider.id, "Provider recovered, new instances allowed"),
                None => {}
            },
            Err(StoreError::NotFound) => {
                debug!(provider_id = %provider.id, "Provider removed during health check");
                change = None;
            }
            Err(e) => {
                warn!(provider_id = %provider.id, error = %e, "Failed to persist health result");
                change = None;
            }
        }
        change
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Fail overdue running tasks. Returns how many were reclaimed.
    ///
    /// # Errors
    ///
    /// Returns an error if running tasks cannot be listed.
    pub fn run_timeout_sweep(&self) -> Result<usize> {
        Ok(self.engine.sweep_timeouts(Utc::now())?.len())
    }

    /// Run every maintenance step once. Steps fail independently.
    pub async fn run_maintenance_round(&self) -> MaintenanceReport {
        let now = Utc::now();
        let mut report = MaintenanceReport::default();

        match self.sessions.prune_expired().await {
            Ok(n) => report.pruned_sessions = n,
            Err(e) => warn!(error = %e, "Session pruning failed"),
        }
        match self.teardown_expired_instances(now).await {
            Ok(n) => report.expired_instances = n,
            Err(e) => warn!(error = %e, "Expired instance teardown failed"),
        }
        match self.demote_inactive_providers(now) {
            Ok(n) => report.demoted_providers = n,
            Err(e) => warn!(error = %e, "Provider demotion failed"),
        }
        match self.engine.cleanup_old_tasks(self.engine.config().retention()) {
            Ok(n) => report.deleted_tasks = n,
            Err(e) => warn!(error = %e, "Task cleanup failed"),
        }
        if let Err(e) = self.engine.dispatch_all() {
            warn!(error = %e, "Dispatch failed");
        }

        info!(
            pruned_sessions = report.pruned_sessions,
            expired_instances = report.expired_instances,
            demoted_providers = report.demoted_providers,
            deleted_tasks = report.deleted_tasks,
            "Maintenance round complete"
        );
        report
    }

    /// Remove instances whose lease has ended.
    ///
    /// The backend instance is deleted best-effort; the record, its port
    /// mappings, and its usage are released in one store write regardless.
    /// Instances with a pending or running task are left for a later round.
    ///
    /// # Errors
    ///
    /// Returns an error if instances or tasks cannot be listed.
    pub async fn teardown_expired_instances(&self, now: DateTime<Utc>) -> Result<usize> {
        let store = self.engine.store();
        let mut busy: HashSet<InstanceId> = HashSet::new();
        for status in [TaskStatus::Pending, TaskStatus::Running] {
            busy.extend(
                store
                    .list_tasks_by_status(status)?
                    .into_iter()
                    .filter_map(|t| t.instance_id),
            );
        }

        let mut removed = 0;
        for instance in store.list_all_instances()? {
            if !instance.is_expired(now) || busy.contains(&instance.id) {
                continue;
            }
            match self.teardown_instance(&instance).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(instance_id = %instance.id, error = %e, "Failed to remove expired instance"),
            }
        }
        Ok(removed)
    }

    async fn teardown_instance(&self, instance: &Instance) -> Result<()> {
        let store = self.engine.store();
        if let Some(provider) = store.get_provider(instance.provider_id)? {
            match self.engine.pool().connected(&provider).await {
                Ok(backend) => match backend.delete_instance(&instance.name).await {
                    Ok(()) | Err(ProviderError::NotFound(_)) => {}
                    Err(e) => warn!(
                        instance_id = %instance.id,
                        error = %e,
                        "Backend delete of expired instance failed"
                    ),
                },
                Err(e) => warn!(provider_id = %provider.id, error = %e, "Provider unreachable for expired instance"),
            }
            if let Err(e) = self.engine.ports().teardown(&provider, instance).await {
                warn!(instance_id = %instance.id, error = %e, "Port mapping teardown failed");
            }
        }

        let released = store.purge_instance(instance.id, UsageDelta::released_by(instance))?;
        info!(
            instance_id = %instance.id,
            provider_id = %instance.provider_id,
            released_ports = released.len(),
            "Expired instance removed"
        );
        Ok(())
    }

    /// Stop claims on providers not seen active within the inactivity window.
    ///
    /// # Errors
    ///
    /// Returns an error if providers cannot be listed.
    pub fn demote_inactive_providers(&self, now: DateTime<Utc>) -> Result<usize> {
        let window = self.config.provider_inactive_after();
        let mut demoted = 0;
        for provider in self.engine.store().list_providers()? {
            if !provider.allow_claim
                || provider.deleted_at.is_some()
                || !is_long_inactive(&provider, now, window)
            {
                continue;
            }
            self.engine
                .store()
                .update_provider(provider.id, &mut |p| p.allow_claim = false)?;
            warn!(
                provider_id = %provider.id,
                status = ?provider.status,
                inactive_hours = self.config.provider_inactive_hours,
                "Long-inactive provider no longer accepts new instances"
            );
            demoted += 1;
        }
        Ok(demoted)
    }

    // =========================================================================
    // Traffic
    // =========================================================================

    /// Sync usage, then evaluate thresholds.
    pub async fn run_traffic_round(&self) {
        if let Err(e) = self.traffic.sync_usage().await {
            warn!(error = %e, "Traffic usage sync failed");
        }
        if let Err(e) = self.traffic.evaluate_thresholds().await {
            warn!(error = %e, "Traffic threshold evaluation failed");
        }
    }
}

fn unreachable_result(error: &ProviderError, started: Instant) -> HealthResult {
    let elapsed = started.elapsed();
    let ssh = CheckOutcome {
        status: CheckStatus::Offline,
        error: Some(error.to_string()),
        duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
    };
    HealthResult::from_checks(
        ssh,
        CheckOutcome::unconfigured(),
        CheckOutcome::unconfigured(),
        Utc::now(),
        elapsed,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use virtfleet_core::ProviderId;
    use virtfleet_engine::{CreateTaskRequest, EngineConfig};
    use virtfleet_portmap::{PortMapper, PortMappingRegistry};
    use virtfleet_provider::{BackendOptions, MockProvider, ProviderPool, ProviderRegistry};
    use virtfleet_store::{InstanceKind, InstanceStatus, ProviderKind, ProviderStatus, RocksStore, TaskType};

    struct Fixture {
        scheduler: Arc<Scheduler<RocksStore>>,
        store: Arc<RocksStore>,
        backend: Arc<MockProvider>,
        _dir: TempDir,
    }

    fn fixture(configure: impl FnOnce(&mut Provider)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());

        let mut provider = Provider::new(ProviderId::new(1), "edge-1", ProviderKind::Docker, "198.51.100.7");
        configure(&mut provider);
        store.put_provider(&provider).unwrap();

        let backend = Arc::new(MockProvider::new(ProviderKind::Docker));
        let pool = Arc::new(ProviderPool::new(Arc::new(ProviderRegistry::new(BackendOptions::default()))));
        pool.insert(provider.id, backend.clone());
        let ports = Arc::new(PortMapper::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::new(PortMappingRegistry::with_builtin()),
        ));
        let engine = TaskEngine::new(
            Arc::clone(&store),
            pool,
            ports,
            EngineConfig {
                auto_dispatch: false,
                ..EngineConfig::default()
            },
        );
        let scheduler = Arc::new(Scheduler::new(engine, SchedulerConfig::default()));
        Fixture {
            scheduler,
            store,
            backend,
            _dir: dir,
        }
    }

    fn provider(store: &RocksStore) -> Provider {
        store.get_provider(ProviderId::new(1)).unwrap().unwrap()
    }

    fn outcome(status: CheckStatus) -> CheckOutcome {
        CheckOutcome {
            status,
            error: (status == CheckStatus::Offline).then(|| "timed out".to_string()),
            duration_ms: 2,
        }
    }

    fn expiring_instance(store: &RocksStore, id: u64, name: &str) -> Instance {
        let mut instance = Instance::new(
            InstanceId::new(id),
            ProviderId::new(1),
            name,
            InstanceKind::Container,
            "debian:12",
        );
        instance.status = InstanceStatus::Running;
        instance.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.put_instance(&instance).unwrap();
        store
            .adjust_provider_usage(ProviderId::new(1), UsageDelta::for_instance(&instance))
            .unwrap();
        instance
    }

    #[tokio::test]
    async fn health_round_blocks_claims_on_degradation() {
        let fx = fixture(|p| p.status = ProviderStatus::Active);
        fx.backend.set_health(HealthResult::from_checks(
            outcome(CheckStatus::Online),
            outcome(CheckStatus::Offline),
            CheckOutcome::unconfigured(),
            Utc::now(),
            Duration::from_millis(5),
        ));

        let report = fx.scheduler.run_health_round().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.claims_blocked, 1);

        let p = provider(&fx.store);
        assert_eq!(p.status, ProviderStatus::Partial);
        assert_eq!(p.api_status, CheckStatus::Offline);
        assert!(!p.allow_claim);
        assert!(p.last_health_check.is_some());
    }

    #[tokio::test]
    async fn health_round_reallows_recovered_provider() {
        let fx = fixture(|p| {
            p.status = ProviderStatus::Inactive;
            p.allow_claim = false;
        });

        let report = fx.scheduler.run_health_round().await.unwrap();
        assert_eq!(report.claims_allowed, 1);
        let p = provider(&fx.store);
        assert_eq!(p.status, ProviderStatus::Active);
        assert!(p.allow_claim);
    }

    #[tokio::test]
    async fn health_round_skips_frozen_and_expired_providers() {
        let fx = fixture(|p| p.is_frozen = true);
        let mut expired = Provider::new(ProviderId::new(2), "edge-2", ProviderKind::Docker, "198.51.100.8");
        expired.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        fx.store.put_provider(&expired).unwrap();

        let report = fx.scheduler.run_health_round().await.unwrap();
        assert_eq!(report.checked, 0);
        assert!(fx.backend.calls_of("health_check").is_empty());
        assert!(provider(&fx.store).last_health_check.is_none());
    }

    #[tokio::test]
    async fn failing_health_check_marks_provider_inactive() {
        let fx = fixture(|p| p.status = ProviderStatus::Active);
        fx.backend.fail_connectivity("health_check");

        fx.scheduler.run_health_round().await.unwrap();
        let p = provider(&fx.store);
        assert_eq!(p.status, ProviderStatus::Inactive);
        assert_eq!(p.ssh_status, CheckStatus::Offline);
        assert!(!p.allow_claim);
    }

    #[tokio::test]
    async fn expired_instances_are_torn_down() {
        let fx = fixture(|_| {});
        let instance = expiring_instance(&fx.store, 7, "ttl-7");
        fx.backend.insert_instance("ttl-7", InstanceKind::Container, "running");
        assert_eq!(provider(&fx.store).usage.container_count, 1);

        let removed = fx.scheduler.teardown_expired_instances(Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(fx.store.get_instance(instance.id).unwrap().is_none());
        assert_eq!(provider(&fx.store).usage.container_count, 0);
        assert_eq!(fx.backend.calls_of("delete_instance").len(), 1);
    }

    #[tokio::test]
    async fn expired_instance_is_removed_even_if_backend_delete_fails() {
        let fx = fixture(|_| {});
        let instance = expiring_instance(&fx.store, 8, "ttl-8");
        fx.backend.fail("delete_instance", "device busy");

        let removed = fx.scheduler.teardown_expired_instances(Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(fx.store.get_instance(instance.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_instance_with_active_task_is_kept() {
        let fx = fixture(|_| {});
        let instance = expiring_instance(&fx.store, 9, "ttl-9");
        fx.scheduler
            .engine()
            .create_task(CreateTaskRequest::new(ProviderId::new(1), Some(instance.id), TaskType::Stop))
            .unwrap();

        let removed = fx.scheduler.teardown_expired_instances(Utc::now()).await.unwrap();
        assert_eq!(removed, 0);
        assert!(fx.store.get_instance(instance.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn long_inactive_providers_are_demoted() {
        let fx = fixture(|p| {
            p.status = ProviderStatus::Inactive;
            p.last_active_at = Some(Utc::now() - chrono::Duration::hours(100));
        });
        let mut recent = Provider::new(ProviderId::new(2), "edge-2", ProviderKind::Docker, "198.51.100.8");
        recent.status = ProviderStatus::Partial;
        recent.last_active_at = Some(Utc::now() - chrono::Duration::hours(2));
        fx.store.put_provider(&recent).unwrap();

        let demoted = fx.scheduler.demote_inactive_providers(Utc::now()).unwrap();
        assert_eq!(demoted, 1);
        assert!(!provider(&fx.store).allow_claim);
        assert!(fx.store.get_provider(ProviderId::new(2)).unwrap().unwrap().allow_claim);
    }

    #[tokio::test]
    async fn timeout_sweep_reclaims_overdue_task() {
        let fx = fixture(|_| {});
        let mut instance = Instance::new(InstanceId::new(3), ProviderId::new(1), "web-3", InstanceKind::Container, "nginx");
        instance.status = InstanceStatus::Running;
        fx.store.put_instance(&instance).unwrap();
        fx.backend.insert_instance("web-3", InstanceKind::Container, "running");
        fx.backend.set_delay(Duration::from_secs(600));

        let engine = fx.scheduler.engine();
        let task = engine
            .create_task(CreateTaskRequest::new(ProviderId::new(1), Some(instance.id), TaskType::Restart))
            .unwrap();
        engine.start_task(&task.id).unwrap();
        fx.store
            .update_task(&task.id, &mut |t| {
                t.started_at = Some(Utc::now() - chrono::Duration::hours(2));
                true
            })
            .unwrap();

        assert_eq!(fx.scheduler.run_timeout_sweep().unwrap(), 1);
        let task = fx.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(engine.running_count(ProviderId::new(1)), 0);
    }

    #[derive(Default)]
    struct Counting {
        syncs: AtomicUsize,
        evaluations: AtomicUsize,
        prunes: AtomicUsize,
    }

    #[async_trait]
    impl TrafficSync for Counting {
        async fn sync_usage(&self) -> Result<()> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn evaluate_thresholds(&self) -> Result<()> {
            self.evaluations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl SessionPruner for Counting {
        async fn prune_expired(&self) -> Result<usize> {
            self.prunes.fetch_add(1, Ordering::SeqCst);
            Ok(4)
        }
    }

    #[tokio::test]
    async fn maintenance_and_traffic_drive_collaborators() {
        let counting = Arc::new(Counting::default());
        let fx = fixture(|_| {});
        let scheduler = Scheduler::new(Arc::clone(&fx.scheduler.engine), SchedulerConfig::default())
            .with_traffic_sync(counting.clone())
            .with_session_pruner(counting.clone());

        let report = scheduler.run_maintenance_round().await;
        assert_eq!(report.pruned_sessions, 4);
        scheduler.run_traffic_round().await;

        assert_eq!(counting.prunes.load(Ordering::SeqCst), 1);
        assert_eq!(counting.syncs.load(Ordering::SeqCst), 1);
        assert_eq!(counting.evaluations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn loops_run_health_at_start_and_stop_on_shutdown() {
        let fx = fixture(|_| {});
        let (tx, rx) = watch::channel(false);
        let handles = Arc::clone(&fx.scheduler).spawn(rx);

        tokio::time::timeout(Duration::from_secs(5), async {
            while provider(&fx.store).last_health_check.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
