//! Prometheus metrics collection.
//!
//! Admission outcomes, store health, and sweeper activity in Prometheus format.

use prometheus_client::encoding::{EncodeLabelSet, text::encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

/// Admission check labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AdmissionLabels {
    pub scope: String,
    pub outcome: String,
}

/// Per-scope labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ScopeLabels {
    pub scope: String,
}

/// How a single admission check ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Admitted,
    Rejected,
    FaultOpen,
    FaultClosed,
    Skipped,
}

impl CheckOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckOutcome::Admitted => "admitted",
            CheckOutcome::Rejected => "rejected",
            CheckOutcome::FaultOpen => "fault_open",
            CheckOutcome::FaultClosed => "fault_closed",
            CheckOutcome::Skipped => "skipped",
        }
    }
}

/// Application metrics.
pub struct Metrics {
    registry: Registry,

    /// Admission checks by scope and outcome.
    pub admission_checks: Family<AdmissionLabels, Counter>,

    /// Store calls retried after a transient failure.
    pub store_retries: Family<ScopeLabels, Counter>,

    /// Checks whose store calls exhausted the retry budget.
    pub store_faults: Family<ScopeLabels, Counter>,

    /// Duration of a full store call including retries.
    pub store_call_duration_seconds: Histogram,

    /// Rate limit rejections counter.
    pub rate_limit_rejections: Counter,

    /// Completed sweeper runs.
    pub sweeper_runs: Counter,

    /// Records removed by the sweeper.
    pub sweeper_deleted_records: Counter,
}

impl Metrics {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let admission_checks = Family::<AdmissionLabels, Counter>::default();
        registry.register(
            "admission_checks",
            "Admission checks by scope and outcome",
            admission_checks.clone(),
        );

        let store_retries = Family::<ScopeLabels, Counter>::default();
        registry.register(
            "store_retries",
            "Window store calls retried after contention or a transient error",
            store_retries.clone(),
        );

        let store_faults = Family::<ScopeLabels, Counter>::default();
        registry.register(
            "store_faults",
            "Admission checks that exhausted the store retry budget",
            store_faults.clone(),
        );

        let store_call_duration_seconds = Histogram::new(exponential_buckets(0.0005, 2.0, 14));
        registry.register(
            "store_call_duration_seconds",
            "Window store call duration in seconds, including retries",
            store_call_duration_seconds.clone(),
        );

        let rate_limit_rejections = Counter::default();
        registry.register(
            "rate_limit_rejections",
            "Rate limit rejections",
            rate_limit_rejections.clone(),
        );

        let sweeper_runs = Counter::default();
        registry.register(
            "sweeper_runs",
            "Completed cleanup sweeper runs",
            sweeper_runs.clone(),
        );

        let sweeper_deleted_records = Counter::default();
        registry.register(
            "sweeper_deleted_records",
            "Idle rate limit records removed by the sweeper",
            sweeper_deleted_records.clone(),
        );

        Self {
            registry,
            admission_checks,
            store_retries,
            store_faults,
            store_call_duration_seconds,
            rate_limit_rejections,
            sweeper_runs,
            sweeper_deleted_records,
        }
    }

    /// Record the outcome of an admission check.
    pub fn record_check(&self, scope: &str, outcome: CheckOutcome) {
        let labels = AdmissionLabels {
            scope: scope.to_string(),
            outcome: outcome.as_str().to_string(),
        };
        self.admission_checks.get_or_create(&labels).inc();

        if outcome == CheckOutcome::Rejected {
            self.rate_limit_rejections.inc();
        }
    }

    /// Record retries spent on a store call.
    pub fn record_retries(&self, scope: &str, retries: u32) {
        if retries == 0 {
            return;
        }
        let labels = ScopeLabels {
            scope: scope.to_string(),
        };
        self.store_retries
            .get_or_create(&labels)
            .inc_by(u64::from(retries));
    }

    /// Record a store fault after the retry budget ran out.
    pub fn record_fault(&self, scope: &str) {
        let labels = ScopeLabels {
            scope: scope.to_string(),
        };
        self.store_faults.get_or_create(&labels).inc();
    }

    /// Record a store call duration.
    pub fn record_store_call(&self, duration_secs: f64) {
        self.store_call_duration_seconds.observe(duration_secs);
    }

    /// Record a completed sweep.
    pub fn record_sweep(&self, deleted: u64) {
        self.sweeper_runs.inc();
        self.sweeper_deleted_records.inc_by(deleted);
    }

    /// Current count for a scope/outcome pair.
    pub fn check_count(&self, scope: &str, outcome: CheckOutcome) -> u64 {
        let labels = AdmissionLabels {
            scope: scope.to_string(),
            outcome: outcome.as_str().to_string(),
        };
        self.admission_checks.get_or_create(&labels).get()
    }

    /// Current fault count for a scope.
    pub fn fault_count(&self, scope: &str) -> u64 {
        let labels = ScopeLabels {
            scope: scope.to_string(),
        };
        self.store_faults.get_or_create(&labels).get()
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Panics
    ///
    /// Panics if Prometheus metric encoding to a `String` buffer fails.
    /// The `fmt::Write` impl for `String` is infallible, and all metric
    /// labels use derived `EncodeLabelSet` impls that do not produce
    /// `fmt::Error`.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        // Prometheus encoding to String buffer is infallible
        #[allow(clippy::expect_used)]
        encode(&mut buffer, &self.registry).expect("encoding metrics");
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish()
    }
}
