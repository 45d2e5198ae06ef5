use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{RapportError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 200,
        }
    }
}

/// Run `action`, retrying transient storage failures with jittered exponential backoff.
pub async fn with_backoff<T, F, Fut>(policy: RetryPolicy, mut action: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let strategy = ExponentialBackoff::from_millis(policy.base_delay_ms.max(1))
        .max_delay(Duration::from_secs(10))
        .map(jitter)
        .take(policy.attempts);

    RetryIf::start(strategy, || action(), |e: &RapportError| {
        let transient = e.is_transient();
        if transient {
            tracing::debug!(error = %e, "Transient storage error, retrying");
        }
        transient
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let result = with_backoff(fast(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RapportError::StorageUnavailable(sqlx::Error::PoolTimedOut))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_fatal_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_backoff(fast(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RapportError::MemberNotFound {
                guild_id: "g".into(),
                user_id: "u".into(),
            })
        })
        .await;

        assert!(matches!(result, Err(RapportError::MemberNotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
