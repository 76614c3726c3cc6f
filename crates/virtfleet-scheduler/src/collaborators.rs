//! External subsystems driven by the scheduler loops.

use async_trait::async_trait;

use crate::error::Result;

/// Traffic metering: usage collection and threshold enforcement.
#[async_trait]
pub trait TrafficSync: Send + Sync {
    /// Pull usage counters from providers into the metering store.
    async fn sync_usage(&self) -> Result<()>;

    /// Act on instances over their traffic allowance.
    async fn evaluate_thresholds(&self) -> Result<()>;
}

/// Expiry of sessions and token blacklist entries.
#[async_trait]
pub trait SessionPruner: Send + Sync {
    /// Remove expired entries, returning how many were removed.
    async fn prune_expired(&self) -> Result<usize>;
}

/// A [`TrafficSync`] that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTrafficSync;

#[async_trait]
impl TrafficSync for NoopTrafficSync {
    async fn sync_usage(&self) -> Result<()> {
        Ok(())
    }

    async fn evaluate_thresholds(&self) -> Result<()> {
        Ok(())
    }
}

/// A [`SessionPruner`] that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSessionPruner;

#[async_trait]
impl SessionPruner for NoopSessionPruner {
    async fn prune_expired(&self) -> Result<usize> {
        Ok(0)
    }
}
