//! Sliding-window admission decision.
//!
//! Pure functions over the numbers a window store reports; no I/O, no clock.

use crate::store::{WindowCount, WindowSpec};

/// Verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Admitted; `remaining` slots are left in the current window.
    Admit { remaining: u64 },
    /// Quota exhausted; a retry after `retry_after_secs` should succeed.
    Reject { retry_after_secs: u64 },
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit { .. })
    }
}

/// Decide admission from the store's pre-append count.
pub fn decide(observed: WindowCount, spec: WindowSpec, now_ms: i64) -> Decision {
    if observed.count < spec.max {
        Decision::Admit {
            remaining: spec.max - observed.count - 1,
        }
    } else {
        Decision::Reject {
            retry_after_secs: retry_after_secs(observed.oldest_ms, spec.window_ms, now_ms),
        }
    }
}

/// Seconds until the oldest surviving entry leaves the window, rounded up.
///
/// Clamped at zero: a timestamp from a fast clock on another instance can
/// put the expiry in the past.
pub fn retry_after_secs(oldest_ms: Option<i64>, window_ms: u64, now_ms: i64) -> u64 {
    let Some(oldest) = oldest_ms else {
        return window_ms.div_ceil(1000);
    };

    let wait_ms = oldest
        .saturating_add(window_ms as i64)
        .saturating_sub(now_ms);
    if wait_ms <= 0 {
        0
    } else {
        (wait_ms as u64).div_ceil(1000)
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SPEC: WindowSpec = WindowSpec {
        window_ms: 1000,
        max: 2,
    };

    fn observed(count: u64, oldest_ms: Option<i64>) -> WindowCount {
        WindowCount { count, oldest_ms }
    }

    #[test]
    fn test_admit_below_quota() {
        assert_eq!(
            decide(observed(0, None), SPEC, 0),
            Decision::Admit { remaining: 1 }
        );
        assert_eq!(
            decide(observed(1, Some(0)), SPEC, 10),
            Decision::Admit { remaining: 0 }
        );
    }

    #[test]
    fn test_reject_at_quota_with_hint() {
        assert_eq!(
            decide(observed(2, Some(0)), SPEC, 20),
            Decision::Reject {
                retry_after_secs: 1
            }
        );
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Some(0), 60_000, 1), 60);
        assert_eq!(retry_after_secs(Some(0), 60_000, 59_001), 1);
        assert_eq!(retry_after_secs(Some(0), 60_000, 59_000), 1);
        assert_eq!(retry_after_secs(Some(0), 60_000, 58_999), 2);
    }

    #[test]
    fn test_retry_after_clamped_under_skew() {
        assert_eq!(retry_after_secs(Some(0), 1000, 5_000), 0);
        assert_eq!(retry_after_secs(Some(0), 1000, 1000), 0);
    }

    #[test]
    fn test_retry_after_without_oldest_uses_window() {
        assert_eq!(retry_after_secs(None, 1500, 0), 2);
    }

    #[test]
    fn test_waiting_out_the_hint_frees_a_slot() {
        // Entries survive while ts > now - window.
        let oldest = 40;
        let now = 100;
        let wait = retry_after_secs(Some(oldest), SPEC.window_ms, now);
        let later = now + (wait as i64) * 1000;
        assert!(oldest <= SPEC.cutoff(later));
    }
}
