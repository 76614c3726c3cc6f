//! Bounded retry for destructive remote operations.

use std::future::Future;
use std::time::Duration;

use tracing::warn;
use virtfleet_store::Provider;

use crate::capability::Connection;
use crate::error::{ProviderError, Result};

/// Default number of attempts for destructive operations.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Retry policy: `attempts` tries, sleeping `attempt × backoff_step` and
/// reconnecting between them, each try bounded by `attempt_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub attempts: u32,
    /// Backoff unit.
    pub backoff_step: Duration,
    /// Deadline of a single try.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff_step: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Policy for a provider: the per-attempt deadline is its execute timeout.
    #[must_use]
    pub fn for_provider(provider: &Provider, attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            attempt_timeout: Duration::from_secs(provider.ssh_execute_timeout_secs.max(1)),
            ..Self::default()
        }
    }

    /// Sleep before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }

    /// Run `op`, retrying connectivity failures and timeouts.
    ///
    /// Before each retry the connection is re-established through `conn`.
    /// Logical failures are returned immediately.
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted, or the first
    /// non-connectivity error.
    pub async fn run<C, T, F, Fut>(&self, operation: &str, conn: &C, mut op: F) -> Result<T>
    where
        C: Connection + ?Sized,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    operation: operation.to_string(),
                    secs: self.attempt_timeout.as_secs(),
                }),
            };

            match result {
                Err(e) if e.is_connectivity() && attempt < self.attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Connectivity failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if let Err(reconnect) = conn.ensure_connection().await {
                        warn!(operation, error = %reconnect, "Reconnect failed");
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use virtfleet_store::ProviderKind;

    #[derive(Default)]
    struct CountingConnection {
        reconnects: AtomicU32,
    }

    #[async_trait]
    impl Connection for CountingConnection {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Docker
        }
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) {}
        fn is_connected(&self) -> bool {
            false
        }
        async fn ensure_connection(&self) -> Result<()> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn execute_ssh_command(&self, _command: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_connectivity_then_succeeds() {
        let conn = CountingConnection::default();
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let value = policy
            .run("delete", &conn, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Connectivity("connection reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(conn.reconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempts() {
        let conn = CountingConnection::default();
        let calls = &AtomicU32::new(0);

        let err = RetryPolicy::default()
            .run("delete", &conn, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::Connectivity("broken pipe".into()))
            })
            .await
            .unwrap_err();

        assert!(err.is_connectivity());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn logical_errors_are_not_retried() {
        let conn = CountingConnection::default();
        let calls = &AtomicU32::new(0);

        let err = RetryPolicy::default()
            .run("delete", &conn, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::NotFound("web".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(conn.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempt_hits_its_deadline() {
        let conn = CountingConnection::default();
        let policy = RetryPolicy {
            attempts: 2,
            attempt_timeout: Duration::from_secs(5),
            ..RetryPolicy::default()
        };

        let err = policy
            .run("delete", &conn, || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Timeout { secs: 5, .. }));
        assert_eq!(conn.reconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(3));
    }
}
