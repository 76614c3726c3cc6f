//! Per-provider cache of constructed backends.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use virtfleet_core::ProviderId;
use virtfleet_store::Provider;

use crate::capability::ProviderBackend;
use crate::error::Result;
use crate::registry::ProviderRegistry;

/// Caches one backend per provider id; backends connect lazily.
pub struct ProviderPool {
    registry: Arc<ProviderRegistry>,
    backends: RwLock<HashMap<ProviderId, Arc<dyn ProviderBackend>>>,
}

impl ProviderPool {
    /// Create an empty pool over `registry`.
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// The backend of `provider`, constructing it on first use.
    ///
    /// # Errors
    ///
    /// Returns the registry's error if the backend cannot be constructed.
    pub fn backend(&self, provider: &Provider) -> Result<Arc<dyn ProviderBackend>> {
        if let Some(backend) = self.backends.read().get(&provider.id) {
            return Ok(Arc::clone(backend));
        }

        let mut backends = self.backends.write();
        if let Some(backend) = backends.get(&provider.id) {
            return Ok(Arc::clone(backend));
        }
        let backend = self.registry.create(provider)?;
        debug!(provider_id = %provider.id, kind = provider.kind.as_str(), "Constructed backend");
        backends.insert(provider.id, Arc::clone(&backend));
        Ok(backend)
    }

    /// The backend of `provider`, connected.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error if the host cannot be reached.
    pub async fn connected(&self, provider: &Provider) -> Result<Arc<dyn ProviderBackend>> {
        let backend = self.backend(provider)?;
        backend.ensure_connection().await?;
        Ok(backend)
    }

    /// Install a backend directly, replacing any cached one.
    pub fn insert(&self, provider_id: ProviderId, backend: Arc<dyn ProviderBackend>) {
        self.backends.write().insert(provider_id, backend);
    }

    /// Drop the cached backend of a provider, disconnecting it.
    ///
    /// Call after the provider is deleted or its connection settings change.
    pub async fn evict(&self, provider_id: ProviderId) {
        let removed = self.backends.write().remove(&provider_id);
        if let Some(backend) = removed {
            backend.disconnect().await;
            debug!(provider_id = %provider_id, "Evicted backend");
        }
    }

    /// Number of cached backends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    /// Returns true if no backend is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BackendOptions;
    use virtfleet_store::ProviderKind;

    #[tokio::test]
    async fn caches_and_evicts() {
        let pool = ProviderPool::new(Arc::new(ProviderRegistry::with_builtin(BackendOptions::default())));
        let provider = Provider::new(ProviderId::new(3), "d", ProviderKind::Docker, "10.0.0.3");

        let first = pool.backend(&provider).unwrap();
        let second = pool.backend(&provider).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);

        pool.evict(provider.id).await;
        assert!(pool.is_empty());
    }
}
