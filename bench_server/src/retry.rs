//! Bounded retry for operations that race on unique constraints.
//!
//! Two writers submitting the same build can both miss the "does it exist"
//! read and both attempt the insert. The loser gets a `Conflict`; re-running
//! the whole operation re-reads and takes the update path instead.

use std::future::Future;
use std::time::Duration;

use crate::error::IngestError;

/// Retry policy for conflict-prone writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the policy
/// is exhausted. `op` receives the 1-based attempt number.
pub async fn retry_on_conflict<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, IngestError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, IngestError>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(IngestError::Store(err)) if err.is_conflict() => {
                crate::metrics::conflict_retry();
                if attempt >= policy.max_attempts {
                    tracing::error!(attempts = attempt, error = %err, "Conflict retries exhausted");
                    return Err(IngestError::RetriesExhausted {
                        attempts: attempt,
                        source: err,
                    });
                }
                tracing::warn!(attempt, error = %err, "Write conflict, retrying");
                attempt += 1;
                tokio::time::sleep(policy.delay).await;
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max: u32) -> RetryPolicy {
        RetryPolicy::fixed(max, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_succeeds_first_time() {
        let calls = AtomicU32::new(0);
        let out = retry_on_conflict(quick(3), |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, IngestError>(7)
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_conflicts() {
        let out = retry_on_conflict(quick(5), |attempt| async move {
            if attempt < 3 {
                Err(IngestError::Store(StoreError::Conflict("dup".into())))
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 3);
    }

    #[tokio::test]
    async fn test_exhaustion_is_typed() {
        let calls = AtomicU32::new(0);
        let err = retry_on_conflict(quick(4), |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(IngestError::Store(StoreError::Conflict("dup".into())))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, IngestError::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = retry_on_conflict(quick(4), |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(IngestError::Validation("name is required".into()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, IngestError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fixed_policy_has_at_least_one_attempt() {
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).max_attempts, 1);
        assert_eq!(RetryPolicy::default().max_attempts, 10);
    }
}
