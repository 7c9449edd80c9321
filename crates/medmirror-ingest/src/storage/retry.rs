// Deadlock retry for batch transactions
//
// Concurrent upserts over overlapping keys can deadlock or fail
// serialization. Those two conditions are retried with exponential backoff
// plus jitter; anything else fails the batch on the first attempt.

use crate::config::WorkerConfig;
use crate::error::{IngestError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// SQLSTATE for a detected deadlock
pub const DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE for a serialization failure
pub const SERIALIZATION_FAILURE: &str = "40001";

const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Database errors that may succeed when the transaction is replayed
pub trait LockConflict {
    fn is_lock_conflict(&self) -> bool;
}

impl LockConflict for sqlx::Error {
    fn is_lock_conflict(&self) -> bool {
        match self {
            sqlx::Error::Database(db) => {
                matches!(db.code().as_deref(), Some(DEADLOCK_DETECTED) | Some(SERIALIZATION_FAILURE))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeadlockPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl DeadlockPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(workers: &WorkerConfig) -> Self {
        Self::new(
            workers.deadlock_max_attempts,
            Duration::from_millis(workers.deadlock_base_delay_ms),
        )
    }

    /// Backoff before attempt `attempt + 1`, without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Backoff plus up to 50% random jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter_ms = backoff.as_millis() as u64 / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        backoff + Duration::from_millis(jitter)
    }
}

/// Run `op` until it succeeds, fails for a non-conflict reason, or the
/// attempt ceiling is reached
///
/// Each call of `op` must be a complete transaction: a failed attempt has
/// already rolled back when it returns.
pub async fn retry_on_deadlock<T, E, F, Fut>(policy: &DeadlockPolicy, label: &str, mut op: F) -> Result<T>
where
    E: LockConflict + Into<IngestError>,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_lock_conflict() => {
                if attempt >= policy.max_attempts {
                    return Err(IngestError::Deadlock { attempts: attempt });
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    batch = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Lock conflict, retrying batch"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum FakeDbError {
        Deadlock,
        Constraint,
    }

    impl LockConflict for FakeDbError {
        fn is_lock_conflict(&self) -> bool {
            matches!(self, FakeDbError::Deadlock)
        }
    }

    impl From<FakeDbError> for IngestError {
        fn from(e: FakeDbError) -> Self {
            IngestError::state(format!("{:?}", e))
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = DeadlockPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(40), MAX_BACKOFF);

        for attempt in 1..5 {
            let delay = policy.delay_for(attempt);
            let backoff = policy.backoff(attempt);
            assert!(delay >= backoff);
            assert!(delay <= backoff + backoff / 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlock_gives_up_after_ceiling() {
        let policy = DeadlockPolicy::new(4, Duration::from_millis(100));
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<()> = retry_on_deadlock(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FakeDbError::Deadlock) }
        })
        .await;

        assert!(matches!(result, Err(IngestError::Deadlock { attempts: 4 })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 100 + 200 + 400 before jitter
        assert!(started.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlock_then_success() {
        let policy = DeadlockPolicy::new(5, Duration::from_millis(50));
        let calls = AtomicU32::new(0);

        let result = retry_on_deadlock(&policy, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FakeDbError::Deadlock)
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let policy = DeadlockPolicy::new(5, Duration::from_millis(50));
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry_on_deadlock(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FakeDbError::Constraint) }
        })
        .await;

        assert!(matches!(result, Err(IngestError::State(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_non_database_errors_are_not_conflicts() {
        assert!(!sqlx::Error::RowNotFound.is_lock_conflict());
        assert!(!sqlx::Error::PoolTimedOut.is_lock_conflict());
    }
}
