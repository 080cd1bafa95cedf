//! In-process window store backed by `DashMap`.
//!
//! The entry guard held across the prune/append makes each call atomic for
//! its key. State is lost on restart and is not shared between instances.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use super::{RateLimitRecord, StoreError, WindowCount, WindowSpec, WindowStore};

/// Window store living in process memory.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    records: DashMap<String, RateLimitRecord>,
}

impl MemoryWindowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of a single record.
    pub fn get(&self, key: &str) -> Option<RateLimitRecord> {
        self.records.get(key).map(|r| r.clone())
    }

    /// Snapshot of every record, sorted by key.
    pub fn snapshot(&self) -> Vec<RateLimitRecord> {
        let mut all: Vec<RateLimitRecord> = self.records.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Insert a record as-is, replacing any existing one.
    pub fn insert(&self, record: RateLimitRecord) {
        self.records.insert(record.key.clone(), record);
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn record_and_count(
        &self,
        key: &str,
        now_ms: i64,
        token: Uuid,
        spec: WindowSpec,
    ) -> Result<WindowCount, StoreError> {
        let mut entry = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::new(key, now_ms));

        Ok(entry.apply(now_ms, token, spec))
    }

    async fn purge_idle(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let before = self.records.len();
        self.records.retain(|_, record| record.newest() >= cutoff_ms);
        let removed = before.saturating_sub(self.records.len()) as u64;

        debug!(removed = removed, "purged idle in-memory records");
        Ok(removed)
    }

    async fn ping(&self) -> bool {
        true
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
