//! Cleanup sweeper for idle rate limit records.
//!
//! Records are never deleted by the request path. A scheduler invokes the
//! sweeper (`POST /cron/{key}` or `tollgate sweep`), which removes every
//! record whose newest timestamp is older than the retention threshold.
//! Deletion is keyed only on age, so overlapping runs on several instances
//! converge on the same record set.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::store::WindowStore;

/// Result of a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepResult {
    /// Sweep ran to completion.
    Completed {
        /// Records removed.
        deleted: u64,
        /// Duration of the run.
        duration_ms: u64,
    },
    /// A sweep is already running in this process.
    Skipped,
    /// Sweep failed with an error.
    Failed(String),
}

/// Last sweep information.
#[derive(Debug, Clone, Serialize)]
pub struct LastSweep {
    pub timestamp: i64,
    pub hostname: String,
    pub deleted: Option<u64>,
    pub duration_ms: u64,
    pub result: String,
}

/// Sweeper service.
pub struct SweeperService {
    store: Arc<dyn WindowStore>,
    retention: Duration,
    metrics: Arc<Metrics>,
    running: Mutex<()>,
    last_run: parking_lot::RwLock<Option<LastSweep>>,
}

impl SweeperService {
    /// Create a new sweeper.
    pub fn new(store: Arc<dyn WindowStore>, retention: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            retention,
            metrics,
            running: Mutex::new(()),
            last_run: parking_lot::RwLock::new(None),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Records whose newest timestamp is before this instant are idle.
    pub fn cutoff(&self, now_ms: i64) -> i64 {
        let retention_ms = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_sub(retention_ms)
    }

    /// Run one sweep at the current wall-clock time.
    pub async fn run(&self) -> SweepResult {
        self.run_at(chrono::Utc::now().timestamp_millis()).await
    }

    /// Run one sweep as of `now_ms` (epoch milliseconds).
    pub async fn run_at(&self, now_ms: i64) -> SweepResult {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("sweep already running, skipping");
            return SweepResult::Skipped;
        };

        let start = Instant::now();
        let cutoff_ms = self.cutoff(now_ms);

        let result = match self.store.purge_idle(cutoff_ms).await {
            Ok(deleted) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                self.metrics.record_sweep(deleted);
                info!(
                    backend = self.store.backend(),
                    deleted = deleted,
                    cutoff_ms = cutoff_ms,
                    duration_ms = duration_ms,
                    "sweep completed"
                );
                SweepResult::Completed {
                    deleted,
                    duration_ms,
                }
            }
            Err(e) => {
                warn!(backend = self.store.backend(), error = %e, "sweep failed");
                SweepResult::Failed(e.to_string())
            }
        };

        self.record_run(&result, start.elapsed());
        result
    }

    /// Get the last sweep status.
    pub fn last_run(&self) -> Option<LastSweep> {
        self.last_run.read().clone()
    }

    fn record_run(&self, result: &SweepResult, elapsed: Duration) {
        let (deleted, label) = match result {
            SweepResult::Completed { deleted, .. } => (Some(*deleted), "completed".to_string()),
            SweepResult::Skipped => return,
            SweepResult::Failed(e) => (None, format!("failed: {e}")),
        };

        *self.last_run.write() = Some(LastSweep {
            timestamp: chrono::Utc::now().timestamp(),
            hostname: hostname(),
            deleted,
            duration_ms: elapsed.as_millis() as u64,
            result: label,
        });
    }
}

impl std::fmt::Debug for SweeperService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweeperService")
            .field("backend", &self.store.backend())
            .field("retention", &self.retention)
            .finish()
    }
}

/// Get hostname for run identification.
fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
