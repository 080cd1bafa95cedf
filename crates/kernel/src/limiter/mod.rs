//! Scoped sliding-window rate limiters.
//!
//! A [`ScopedLimiter`] owns one scope's immutable configuration, the shared
//! window store, and the contention policy. Its `check` is the single
//! admission entry point the HTTP layer calls.

mod policy;
mod window;

pub use policy::{Attempted, ContentionPolicy, FaultMode};
pub use window::{Decision, decide, retry_after_secs};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::metrics::{CheckOutcome, Metrics};
use crate::store::{WindowSpec, WindowStore};

/// Keyspace a limiter applies to. Records of different scopes never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Client network address.
    Ip,
    /// Verified client identity.
    Fingerprint,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::Fingerprint => "fingerprint",
        }
    }

    /// Store key for `identifier` in this scope.
    pub fn key(&self, identifier: &str) -> String {
        format!("{}:{identifier}", self.as_str())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip" => Ok(Scope::Ip),
            "fingerprint" => Ok(Scope::Fingerprint),
            other => Err(format!("unknown rate limit scope: {other}")),
        }
    }
}

/// Per-scope limits, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeConfig {
    pub window_ms: u64,
    pub max: u64,
    pub enabled: bool,
}

impl ScopeConfig {
    pub fn spec(&self) -> WindowSpec {
        WindowSpec {
            window_ms: self.window_ms,
            max: self.max,
        }
    }
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The scope's quota is used up for the current window.
    QuotaExceeded { scope: Scope, retry_after_secs: u64 },
    /// The store stayed unhealthy and the policy fails closed.
    Fault { scope: Scope },
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Let the request through. `remaining` is `None` when the scope is
    /// disabled or the check failed open.
    Proceed { remaining: Option<u64> },
    Rejected(Rejection),
}

impl Admission {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Admission::Proceed { .. })
    }
}

/// Sliding-window limiter for one scope.
pub struct ScopedLimiter {
    scope: Scope,
    config: ScopeConfig,
    store: Arc<dyn WindowStore>,
    policy: ContentionPolicy,
    metrics: Arc<Metrics>,
}

impl ScopedLimiter {
    /// Create a new limiter.
    pub fn new(
        scope: Scope,
        config: ScopeConfig,
        store: Arc<dyn WindowStore>,
        policy: ContentionPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            scope,
            config,
            store,
            policy,
            metrics,
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn policy(&self) -> &ContentionPolicy {
        &self.policy
    }

    /// Check admission for `identifier` at the current wall-clock time.
    pub async fn check(&self, identifier: &str) -> Admission {
        self.check_at(identifier, chrono::Utc::now().timestamp_millis())
            .await
    }

    /// Check admission for `identifier` as of `now_ms` (epoch milliseconds).
    ///
    /// The store call and its retries run on a spawned task, so dropping the
    /// returned future (client disconnect) does not abort a write that may
    /// already have consumed a slot.
    ///
    /// Every attempt carries the same admission token. An attempt that timed
    /// out after its write landed is retried without taking a second slot.
    pub async fn check_at(&self, identifier: &str, now_ms: i64) -> Admission {
        let scope = self.scope.as_str();
        if !self.config.enabled {
            self.metrics.record_check(scope, CheckOutcome::Skipped);
            return Admission::Proceed { remaining: None };
        }

        let key = self.scope.key(identifier);
        let spec = self.config.spec();
        let token = Uuid::now_v7();
        trace!(key = %key, now_ms = now_ms, token = %token, "checking admission");

        let store = self.store.clone();
        let policy = self.policy.clone();
        let task_key = key.clone();
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            policy
                .run(move || {
                    let store = store.clone();
                    let key = task_key.clone();
                    async move { store.record_and_count(&key, now_ms, token, spec).await }
                })
                .await
        });

        let attempted = match handle.await {
            Ok(attempted) => attempted,
            Err(e) => {
                error!(scope = scope, key = %key, error = %e, "admission task aborted");
                return self.on_fault();
            }
        };
        self.metrics
            .record_store_call(started.elapsed().as_secs_f64());
        self.metrics
            .record_retries(scope, attempted.attempts.saturating_sub(1));

        let observed = match attempted.result {
            Ok(observed) => observed,
            Err(e) => {
                error!(
                    scope = scope,
                    key = %key,
                    attempts = attempted.attempts,
                    error = %e,
                    "rate limit store unavailable"
                );
                return self.on_fault();
            }
        };

        match decide(observed, spec, now_ms) {
            Decision::Admit { remaining } => {
                self.metrics.record_check(scope, CheckOutcome::Admitted);
                Admission::Proceed {
                    remaining: Some(remaining),
                }
            }
            Decision::Reject { retry_after_secs } => {
                debug!(
                    scope = scope,
                    key = %key,
                    count = observed.count,
                    max = spec.max,
                    retry_after_secs = retry_after_secs,
                    "rate limit exceeded"
                );
                self.metrics.record_check(scope, CheckOutcome::Rejected);
                Admission::Rejected(Rejection::QuotaExceeded {
                    scope: self.scope,
                    retry_after_secs,
                })
            }
        }
    }

    /// Apply the fault mode after the store gave up.
    fn on_fault(&self) -> Admission {
        let scope = self.scope.as_str();
        self.metrics.record_fault(scope);

        match self.policy.fault_mode() {
            FaultMode::FailOpen => {
                self.metrics.record_check(scope, CheckOutcome::FaultOpen);
                Admission::Proceed { remaining: None }
            }
            FaultMode::FailClosed => {
                self.metrics.record_check(scope, CheckOutcome::FaultClosed);
                Admission::Rejected(Rejection::Fault { scope: self.scope })
            }
        }
    }
}

impl fmt::Debug for ScopedLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedLimiter")
            .field("scope", &self.scope)
            .field("config", &self.config)
            .field("policy", &self.policy)
            .field("backend", &self.store.backend())
            .finish()
    }
}
