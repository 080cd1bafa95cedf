//! Window Store: persistent per-key request timestamps.
//!
//! Every backend exposes the same atomic `record_and_count` operation. The
//! request path never reads and writes a record in separate steps; all
//! coordination between concurrent checks happens inside that one call.

mod memory;
mod postgres;
mod redis_zset;

pub use memory::MemoryWindowStore;
pub use postgres::PgWindowStore;
pub use redis_zset::RedisWindowStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Quota and window a record is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    /// Trailing window length in milliseconds.
    pub window_ms: u64,
    /// Maximum admitted requests inside the window.
    pub max: u64,
}

impl WindowSpec {
    /// Oldest instant (exclusive) still inside the window ending at `now_ms`.
    pub fn cutoff(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.window_ms as i64)
    }
}

/// Outcome of one `record_and_count` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Surviving timestamps before `now` was (possibly) appended.
    pub count: u64,
    /// Oldest timestamp that survived pruning, if any.
    pub oldest_ms: Option<i64>,
}

/// One admitted request inside a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Request instant in epoch milliseconds.
    pub at_ms: i64,
    /// Token of the admission check that wrote this entry.
    pub token: Uuid,
}

/// A persisted rate limit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRecord {
    /// `scope:identifier`.
    pub key: String,
    /// Admitted requests in ascending `at_ms` order.
    pub entries: Vec<WindowEntry>,
    pub created_at: i64,
    pub last_updated: i64,
}

impl RateLimitRecord {
    /// Create an empty record first seen at `now_ms`.
    pub fn new(key: impl Into<String>, now_ms: i64) -> Self {
        Self {
            key: key.into(),
            entries: Vec::new(),
            created_at: now_ms,
            last_updated: now_ms,
        }
    }

    /// Request instants in ascending order.
    pub fn timestamps(&self) -> Vec<i64> {
        self.entries.iter().map(|e| e.at_ms).collect()
    }

    /// Newest recorded instant, falling back to the last write.
    pub fn newest(&self) -> i64 {
        self.entries.last().map_or(self.last_updated, |e| e.at_ms)
    }

    /// Prune expired entries and append `now_ms` when a slot is free.
    ///
    /// `token` identifies the admission check. An entry already carrying it
    /// was written by an earlier attempt of the same check: it is not
    /// appended again and is left out of the reported count, so a retry
    /// observes what the first attempt observed.
    ///
    /// This is the read-modify-write every backend must run atomically.
    pub fn apply(&mut self, now_ms: i64, token: Uuid, spec: WindowSpec) -> WindowCount {
        let cutoff = spec.cutoff(now_ms);
        self.entries.retain(|e| e.at_ms > cutoff);

        let mut others = self.entries.iter().filter(|e| e.token != token);
        let oldest_ms = others.next().map(|e| e.at_ms);
        let count = oldest_ms.map_or(0, |_| 1 + others.count() as u64);
        let already_recorded = self.entries.iter().any(|e| e.token == token);

        if !already_recorded && count < spec.max {
            // Clock skew between instances can hand us an instant older than the tail.
            let pos = self.entries.partition_point(|e| e.at_ms <= now_ms);
            self.entries.insert(pos, WindowEntry { at_ms: now_ms, token });
        }
        self.last_updated = now_ms;

        WindowCount { count, oldest_ms }
    }
}

/// Errors raised by a window store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer updated the record between our read and our write.
    #[error("concurrent update conflict on {0}")]
    Conflict(String),

    #[error("store call timed out after {0} ms")]
    Timeout(u64),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The stored value could not be interpreted. Retrying will not help.
    #[error("malformed record: {0}")]
    Malformed(String),
}

impl StoreError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Malformed(_))
    }
}

/// Persistent store backing the sliding windows.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Atomically prune `key` to the window, append `now_ms` if the pruned
    /// count is below `spec.max`, persist, and report the pre-append count.
    ///
    /// Calls repeating a `token` already in the window append nothing and
    /// report the count as it stood before that token's entry.
    async fn record_and_count(
        &self,
        key: &str,
        now_ms: i64,
        token: Uuid,
        spec: WindowSpec,
    ) -> Result<WindowCount, StoreError>;

    /// Delete records whose newest timestamp is older than `cutoff_ms`.
    ///
    /// Returns the number of records removed. Only the Cleanup Sweeper calls this.
    async fn purge_idle(&self, cutoff_ms: i64) -> Result<u64, StoreError>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> bool;

    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;
}
