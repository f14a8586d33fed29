// src/exec/retry.rs

//! Locked retry: jittered retry of repository mutations under contention.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::ExecSection;
use crate::errors::{Result, StagehandError};

/// Retry budget and back-off for [`run_locked`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts, counting both lock polls and calls of the operation.
    pub retries: u32,
    /// Upper bound of the uniform sleep between attempts.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1000,
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, max_jitter: Duration) -> Self {
        Self {
            retries,
            max_jitter,
        }
    }

    pub fn from_settings(exec: &ExecSection) -> Self {
        Self::new(exec.retries, Duration::from_millis(exec.max_jitter_ms))
    }

    /// No sleeping between attempts; the task still yields.
    pub fn without_jitter(retries: u32) -> Self {
        Self::new(retries, Duration::ZERO)
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=max))
        }
    }

    async fn back_off(&self) {
        let wait = self.jitter();
        if wait.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Run the repository mutation `f` under the locked retry protocol.
///
/// Every attempt first polls `is_locked`; while the lock is held the attempt
/// is spent sleeping a random interval. Otherwise `f` is called and awaited. Transient
/// failures (`LockContention`, `MetadataInvalid`) are swallowed and retried,
/// any other error is returned as is. When the budget runs out the last
/// transient error is wrapped in `LockAcquisitionFailed`.
pub async fn run_locked<T, L, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    is_locked: L,
    mut f: F,
) -> Result<T>
where
    L: Fn() -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last: Option<StagehandError> = None;

    for attempt in 1..=policy.retries {
        if is_locked() {
            trace!(operation, attempt, "repository locked; backing off");
            last = Some(StagehandError::LockContention(format!(
                "lock still held before {operation}"
            )));
            policy.back_off().await;
            continue;
        }

        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() => {
                debug!(operation, attempt, error = %err, "transient failure; retrying");
                last = Some(err);
                policy.back_off().await;
            }
            Err(err) => return Err(err),
        }
    }

    warn!(operation, attempts = policy.retries, "retry budget exhausted");
    Err(StagehandError::LockAcquisitionFailed {
        operation: operation.to_string(),
        attempts: policy.retries,
        source: Box::new(last.unwrap_or_else(|| {
            StagehandError::LockContention(format!("no attempt made for {operation}"))
        })),
    })
}

/// Run blocking store work on tokio's blocking pool.
///
/// Hashing outputs and copying objects must not stall the runtime threads
/// that drive the worker pool.
pub async fn offload<T, F>(operation: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        StagehandError::Other(anyhow::anyhow!("{operation} task did not complete: {e}"))
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn contention_is_retried_until_success() {
        let calls = Cell::new(0u32);
        let out = run_locked(&RetryPolicy::without_jitter(5), "commit", || false, || {
            calls.set(calls.get() + 1);
            let result = if calls.get() < 3 {
                Err(StagehandError::LockContention("lock".into()))
            } else {
                Ok(calls.get())
            };
            async move { result }
        })
        .await
        .unwrap();
        assert_eq!(out, 3);
    }

    #[tokio::test]
    async fn held_lock_is_polled_before_calling() {
        let polls = Cell::new(0u32);
        let calls = Cell::new(0u32);
        run_locked(
            &RetryPolicy::without_jitter(10),
            "restore",
            || {
                polls.set(polls.get() + 1);
                polls.get() <= 2
            },
            || {
                calls.set(calls.get() + 1);
                async { Ok(()) }
            },
        )
        .await
        .unwrap();
        assert_eq!(polls.get(), 3);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_wraps_last_error() {
        let err = run_locked(&RetryPolicy::without_jitter(4), "commit", || false, || async {
            Err::<(), _>(StagehandError::MetadataInvalid("half-written".into()))
        })
        .await
        .unwrap_err();

        match err {
            StagehandError::LockAcquisitionFailed {
                operation,
                attempts,
                source,
            } => {
                assert_eq!(operation, "commit");
                assert_eq!(attempts, 4);
                assert!(matches!(*source, StagehandError::MetadataInvalid(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn semantic_errors_are_not_retried() {
        let calls = Cell::new(0u32);
        let err = run_locked(&RetryPolicy::without_jitter(100), "restore", || false, || {
            calls.set(calls.get() + 1);
            async { Err::<(), _>(StagehandError::RunCacheMiss("train".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StagehandError::RunCacheMiss(_)));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn offloaded_work_returns_its_result() {
        let value = offload("hash", || Ok::<_, StagehandError>(21 * 2)).await.unwrap();
        assert_eq!(value, 42);

        let err = offload("commit", || {
            Err::<(), _>(StagehandError::RunCacheMiss("train".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StagehandError::RunCacheMiss(_)));
    }
}
