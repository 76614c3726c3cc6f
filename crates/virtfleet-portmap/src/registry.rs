//! Type-keyed registry of port mapping methods.

use std::collections::HashMap;
use std::sync::Arc;

use virtfleet_store::{Provider, ProviderKind};

use crate::error::{PortMapError, Result};
use crate::method::PortMappingMethod;
use crate::{docker_native, gost, proxy_device};

/// Constructor of the mapping method for one provider.
pub type MethodFactory = Arc<dyn Fn(&Provider) -> Arc<dyn PortMappingMethod> + Send + Sync>;

/// Maps provider kinds to mapping method constructors.
#[derive(Default)]
pub struct PortMappingRegistry {
    factories: HashMap<ProviderKind, MethodFactory>,
}

impl PortMappingRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in methods: native publishing for
    /// Docker, proxy devices for LXD and Incus, `gost` tunnels for Proxmox.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        docker_native::register(&mut registry);
        proxy_device::register(&mut registry);
        gost::register(&mut registry);
        registry
    }

    /// Register (or replace) the method for `kind`.
    pub fn register(&mut self, kind: ProviderKind, factory: MethodFactory) {
        self.factories.insert(kind, factory);
    }

    /// The method serving `provider`.
    ///
    /// # Errors
    ///
    /// Returns `PortMapError::NoMethod` if nothing is registered for the
    /// provider's kind.
    pub fn method_for(&self, provider: &Provider) -> Result<Arc<dyn PortMappingMethod>> {
        self.factories
            .get(&provider.kind)
            .map(|factory| factory(provider))
            .ok_or(PortMapError::NoMethod(provider.kind))
    }
}
