//! Contention handling around the atomic store call.
//!
//! A [`ContentionPolicy`] bounds how often a conflicting or failing store call
//! is retried and decides, via [`FaultMode`], what a check returns once the
//! retry budget is spent. The sliding-window decision never sees any of this.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::store::StoreError;

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// What to do when the store stays unhealthy after every retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// Admit the request and record the fault.
    FailOpen,
    /// Reject the request with a 500.
    FailClosed,
}

impl FaultMode {
    /// Map the `fail_open` configuration flag to a mode.
    pub fn from_fail_open(fail_open: bool) -> Self {
        if fail_open {
            FaultMode::FailOpen
        } else {
            FaultMode::FailClosed
        }
    }
}

/// Result of running an operation under the policy.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final result after the last attempt.
    pub result: Result<T, StoreError>,
    /// Number of store calls made (at least 1).
    pub attempts: u32,
}

/// Bounded retry with exponential backoff and a per-attempt timeout.
#[derive(Debug, Clone)]
pub struct ContentionPolicy {
    max_attempts: u32,
    base_delay: Duration,
    attempt_timeout: Duration,
    fault_mode: FaultMode,
}

impl ContentionPolicy {
    /// Create a policy. `max_attempts` is clamped to at least one.
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        attempt_timeout: Duration,
        fault_mode: FaultMode,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            attempt_timeout,
            fault_mode,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn fault_mode(&self) -> FaultMode {
        self.fault_mode
    }

    /// Same retry budget with a different fault mode.
    pub fn with_fault_mode(mut self, fault_mode: FaultMode) -> Self {
        self.fault_mode = fault_mode;
        self
    }

    /// Sleep before retrying after the zero-based `attempt` failed.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(self.attempt_timeout.as_millis() as u64)),
            };
            attempt += 1;

            match result {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt - 1);
                    warn!(
                        error = %e,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "store call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Attempted {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

impl Default for ContentionPolicy {
    fn default() -> Self {
        Self::new(
            3,
            Duration::from_millis(100),
            Duration::from_secs(2),
            FaultMode::FailOpen,
        )
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> ContentionPolicy {
        ContentionPolicy::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(200),
            FaultMode::FailOpen,
        )
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = ContentionPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(40), MAX_BACKOFF);
    }

    #[test]
    fn test_default_fails_open() {
        assert_eq!(ContentionPolicy::default().fault_mode(), FaultMode::FailOpen);
        assert_eq!(FaultMode::from_fail_open(false), FaultMode::FailClosed);
    }

    #[tokio::test]
    async fn test_conflict_then_success_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = fast_policy(3);

        let counter = calls.clone();
        let outcome = policy
            .run(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(StoreError::Conflict("ip:x".into()))
                    } else {
                        Ok(7u64)
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), 7);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_stops_at_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = fast_policy(3);

        let counter = calls.clone();
        let outcome: Attempted<u64> = policy
            .run(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StoreError::Conflict("ip:x".into()))
                }
            })
            .await;

        assert!(matches!(outcome.result, Err(StoreError::Conflict(_))));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let policy = fast_policy(3);
        let outcome: Attempted<u64> = policy
            .run(|| async { Err(StoreError::Malformed("bad".into())) })
            .await;

        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out() {
        let policy = ContentionPolicy::new(
            2,
            Duration::from_millis(1),
            Duration::from_millis(10),
            FaultMode::FailClosed,
        );
        let outcome: Attempted<u64> = policy
            .run(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1)
            })
            .await;

        assert!(matches!(outcome.result, Err(StoreError::Timeout(10))));
        assert_eq!(outcome.attempts, 2);
    }
}
