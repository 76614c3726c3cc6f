//! Claim admission driven by health results.
//!
//! `allow_claim` gates new instances only; nothing here touches existing
//! ones. A provider that degrades from active stops accepting claims, and
//! one that recovers from partial or inactive accepts them again. Unknown
//! results and transitions between degraded states leave the flag alone,
//! so a flag set by an administrator survives checks that say nothing new.

use chrono::{DateTime, Utc};
use virtfleet_provider::HealthResult;
use virtfleet_store::{Provider, ProviderStatus};

/// How a status transition changes `allow_claim`, `None` meaning unchanged.
#[must_use]
pub const fn decide(previous: ProviderStatus, next: ProviderStatus) -> Option<bool> {
    use ProviderStatus::{Active, Inactive, Partial};
    match (previous, next) {
        (Active, Partial | Inactive) => Some(false),
        (Partial | Inactive, Active) => Some(true),
        _ => None,
    }
}

/// Copy a health result onto a provider record.
///
/// Updates the per-check statuses and `last_health_check`, stores harvested
/// resource facts, derives the provider status, and applies [`decide`].
/// Returns the admission change, if any.
pub fn apply_health(provider: &mut Provider, result: &HealthResult) -> Option<bool> {
    provider.ssh_status = result.ssh.status;
    provider.api_status = result.api.status;
    provider.last_health_check = Some(result.checked_at);
    if let Some(facts) = &result.resource_info {
        provider.resources = Some(facts.clone());
        provider.resource_synced = true;
    }

    let next = result.status.provider_status()?;
    let previous = provider.status;
    provider.status = next;
    if next == ProviderStatus::Active {
        provider.last_active_at = Some(result.checked_at);
    }

    let change = decide(previous, next);
    if let Some(allow) = change {
        provider.allow_claim = allow;
    }
    change
}

/// Returns true if a provider has not been seen active within `window`.
///
/// Providers that were never active count from their creation.
#[must_use]
pub fn is_long_inactive(provider: &Provider, now: DateTime<Utc>, window: chrono::Duration) -> bool {
    if provider.status == ProviderStatus::Active {
        return false;
    }
    let since = provider.last_active_at.unwrap_or(provider.created_at);
    now.signed_duration_since(since) > window
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use virtfleet_core::ProviderId;
    use virtfleet_provider::CheckOutcome;
    use virtfleet_store::{CheckStatus, ProviderKind, ResourceFacts};

    fn outcome(status: CheckStatus) -> CheckOutcome {
        CheckOutcome {
            status,
            error: (status == CheckStatus::Offline).then(|| "connection refused".to_string()),
            duration_ms: 3,
        }
    }

    fn result(ssh: CheckStatus, api: CheckStatus, service: CheckStatus) -> HealthResult {
        HealthResult::from_checks(outcome(ssh), outcome(api), outcome(service), Utc::now(), Duration::from_millis(9))
    }

    fn provider(status: ProviderStatus) -> Provider {
        let mut provider = Provider::new(ProviderId::new(1), "edge-1", ProviderKind::Lxd, "198.51.100.7");
        provider.status = status;
        provider
    }

    #[test]
    fn degradation_blocks_claims() {
        let mut p = provider(ProviderStatus::Active);
        let change = apply_health(
            &mut p,
            &result(CheckStatus::Online, CheckStatus::Offline, CheckStatus::Unconfigured),
        );
        assert_eq!(change, Some(false));
        assert_eq!(p.status, ProviderStatus::Partial);
        assert!(!p.allow_claim);
        assert_eq!(p.api_status, CheckStatus::Offline);
    }

    #[test]
    fn recovery_reallows_claims() {
        let mut p = provider(ProviderStatus::Partial);
        p.allow_claim = false;
        let change = apply_health(
            &mut p,
            &result(CheckStatus::Online, CheckStatus::Online, CheckStatus::Unconfigured),
        );
        assert_eq!(change, Some(true));
        assert_eq!(p.status, ProviderStatus::Active);
        assert!(p.allow_claim);
        assert!(p.last_active_at.is_some());
    }

    #[test]
    fn unknown_leaves_claims_untouched() {
        for allow in [true, false] {
            let mut p = provider(ProviderStatus::Active);
            p.allow_claim = allow;
            let change = apply_health(
                &mut p,
                &result(CheckStatus::Unconfigured, CheckStatus::Unconfigured, CheckStatus::Unconfigured),
            );
            assert_eq!(change, None);
            assert_eq!(p.allow_claim, allow);
            assert_eq!(p.status, ProviderStatus::Active);
            assert!(p.last_health_check.is_some());
        }
    }

    #[test]
    fn degraded_to_degraded_is_no_change() {
        assert_eq!(decide(ProviderStatus::Partial, ProviderStatus::Inactive), None);
        assert_eq!(decide(ProviderStatus::Unknown, ProviderStatus::Active), None);
        assert_eq!(decide(ProviderStatus::Active, ProviderStatus::Inactive), Some(false));
    }

    #[test]
    fn harvested_facts_mark_synced() {
        let mut p = provider(ProviderStatus::Unknown);
        let mut health = result(CheckStatus::Online, CheckStatus::Unconfigured, CheckStatus::Unconfigured);
        health.resource_info = Some(ResourceFacts {
            cpu_cores: 8,
            memory_mb: 32_768,
            ..ResourceFacts::default()
        });
        apply_health(&mut p, &health);
        assert!(p.resource_synced);
        assert_eq!(p.resources.unwrap().cpu_cores, 8);
    }

    #[test]
    fn long_inactivity_is_measured_from_last_active() {
        let now = Utc::now();
        let window = chrono::Duration::hours(72);
        let mut p = provider(ProviderStatus::Inactive);
        p.last_active_at = Some(now - chrono::Duration::hours(100));
        assert!(is_long_inactive(&p, now, window));

        p.last_active_at = Some(now - chrono::Duration::hours(10));
        assert!(!is_long_inactive(&p, now, window));

        p.status = ProviderStatus::Active;
        p.last_active_at = Some(now - chrono::Duration::hours(100));
        assert!(!is_long_inactive(&p, now, window));
    }
}
