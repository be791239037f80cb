//! Bounded retry with fixed backoff for operations that fail on locked files.
//!
//! Only lock-class failures ([`FsError::is_locked`]) are retried. Anything
//! else is returned on the first attempt. The backoff sleep goes through a
//! [`Sleeper`] so tests never wait on the wall clock, and it is raced against
//! a cancellation token so a permanently locked file cannot stall shutdown.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::{LockedError, TransferError};
use crate::fs::FsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never less than 1.
    pub max_attempts: u32,
    pub wait: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            wait,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(2))
    }
}

/// Where the backoff wait happens.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns immediately and remembers every requested wait.
#[derive(Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.waits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(duration);
        tokio::task::yield_now().await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error(transparent)]
    Locked(#[from] LockedError),

    /// A failure that is not worth retrying.
    #[error(transparent)]
    Failed(FsError),

    #[error("cancelled while waiting for a lock")]
    Cancelled,
}

impl RetryError {
    /// Convert into a [`TransferError`], using `other` for non-lock failures.
    pub fn into_transfer_error(self, other: impl FnOnce(FsError) -> TransferError) -> TransferError {
        match self {
            RetryError::Locked(locked) => TransferError::Locked(locked),
            RetryError::Failed(source) => other(source),
            RetryError::Cancelled => TransferError::Cancelled,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-lock error, or has
/// been attempted `policy.max_attempts` times.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FsError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut waited = Duration::ZERO;
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;

        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_locked() => e,
            Err(e) => return Err(RetryError::Failed(e)),
        };

        if attempt >= max_attempts {
            return Err(RetryError::Locked(LockedError {
                attempts: attempt,
                waited,
                last: error,
            }));
        }

        info!(
            attempt,
            max_attempts,
            wait = ?policy.wait,
            error = %error,
            "Resource locked, retrying"
        );

        tokio::select! {
            _ = sleeper.sleep(policy.wait) => {}
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
        }
        waited += policy.wait;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn locked() -> FsError {
        FsError::Locked {
            path: "/data/a.csv".to_string(),
            reason: "sharing violation".to_string(),
        }
    }

    async fn fail_times(
        failures: u32,
        policy: RetryPolicy,
    ) -> (Result<u32, RetryError>, u32, Vec<Duration>) {
        let calls = AtomicU32::new(0);
        let sleeper = RecordingSleeper::new();
        let cancel = CancellationToken::new();

        let result = retry(&policy, &sleeper, &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= failures {
                    Err(locked())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        (result, calls.load(Ordering::SeqCst), sleeper.waits())
    }

    #[tokio::test]
    async fn succeeds_on_the_attempt_after_transient_failures() {
        let policy = RetryPolicy::new(4, Duration::from_secs(3));
        let (result, calls, waits) = fail_times(2, policy).await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
        assert_eq!(waits, vec![Duration::from_secs(3); 2]);
    }

    #[tokio::test]
    async fn exhausts_after_exactly_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let (result, calls, waits) = fail_times(10, policy).await;

        assert_eq!(calls, 3);
        assert_eq!(waits.len(), 2);
        match result {
            Err(RetryError::Locked(locked)) => {
                assert_eq!(locked.attempts, 3);
                assert_eq!(locked.waited, Duration::from_secs(2));
                assert!(locked.last.is_locked());
            }
            other => panic!("expected Locked, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_lock_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let sleeper = RecordingSleeper::new();
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry(&RetryPolicy::default(), &sleeper, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FsError::NotFound("/data/a.csv".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Failed(FsError::NotFound(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.waits().is_empty());
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 1);
        let (result, calls, _) = fail_times(0, policy).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(3600));
        let calls = AtomicU32::new(0);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = retry(&policy, &TokioSleeper, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(locked()) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
