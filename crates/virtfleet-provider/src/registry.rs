//! Type-keyed backend registry.
//!
//! Each backend module exposes a `register` function that inserts its
//! constructor; [`ProviderRegistry::with_builtin`] calls all of them. The
//! registry is an explicit object owned by the composition root and handed to
//! the engine and scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use virtfleet_store::{Provider, ProviderKind};

use crate::backends;
use crate::backends::image::CdnConfig;
use crate::capability::ProviderBackend;
use crate::error::{ProviderError, Result};
use crate::retry::DEFAULT_ATTEMPTS;

/// Settings shared by every backend the registry constructs.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Attempts for destructive operations on connectivity failures.
    pub retry_attempts: u32,
    /// Image mirrors and download directory.
    pub cdn: CdnConfig,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            retry_attempts: DEFAULT_ATTEMPTS,
            cdn: CdnConfig::default(),
        }
    }
}

/// Constructor of a backend for one provider record.
pub type BackendFactory =
    Arc<dyn Fn(&Provider, &BackendOptions) -> Result<Arc<dyn ProviderBackend>> + Send + Sync>;

/// Maps provider kinds to backend constructors.
pub struct ProviderRegistry {
    factories: HashMap<ProviderKind, BackendFactory>,
    options: BackendOptions,
}

impl ProviderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(options: BackendOptions) -> Self {
        Self {
            factories: HashMap::new(),
            options,
        }
    }

    /// Create a registry with every built-in backend registered.
    #[must_use]
    pub fn with_builtin(options: BackendOptions) -> Self {
        let mut registry = Self::new(options);
        backends::docker::register(&mut registry);
        backends::hypervisor::register(&mut registry);
        backends::proxmox::register(&mut registry);
        registry
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register(&mut self, kind: ProviderKind, factory: BackendFactory) {
        self.factories.insert(kind, factory);
    }

    /// Construct an unconnected backend for `provider`.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::NotRegistered` if no constructor exists for
    /// the provider's kind, or the constructor's own error.
    pub fn create(&self, provider: &Provider) -> Result<Arc<dyn ProviderBackend>> {
        let factory = self
            .factories
            .get(&provider.kind)
            .ok_or(ProviderError::NotRegistered(provider.kind))?;
        factory(provider, &self.options)
    }

    /// Registered kinds.
    #[must_use]
    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    /// Options passed to constructors.
    #[must_use]
    pub const fn options(&self) -> &BackendOptions {
        &self.options
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtin(BackendOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtfleet_core::ProviderId;

    #[test]
    fn builtin_registers_all_kinds() {
        let registry = ProviderRegistry::default();
        assert_eq!(
            registry.kinds(),
            vec![
                ProviderKind::Docker,
                ProviderKind::Incus,
                ProviderKind::Lxd,
                ProviderKind::Proxmox
            ]
        );
    }

    #[test]
    fn unknown_kind_is_not_registered() {
        let registry = ProviderRegistry::new(BackendOptions::default());
        let provider = Provider::new(ProviderId::new(1), "p", ProviderKind::Lxd, "10.0.0.1");
        let err = registry.create(&provider).err().unwrap();
        assert!(matches!(err, ProviderError::NotRegistered(ProviderKind::Lxd)));
    }

    #[test]
    fn builtin_constructs_matching_backend() {
        let registry = ProviderRegistry::default();
        let provider = Provider::new(ProviderId::new(2), "p", ProviderKind::Incus, "10.0.0.2");
        let backend = registry.create(&provider).unwrap();
        assert_eq!(backend.kind(), ProviderKind::Incus);
        assert!(!backend.is_connected());
    }
}
