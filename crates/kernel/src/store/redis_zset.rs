//! Redis window store.
//!
//! Each record is a sorted set of admission tokens scored by epoch
//! milliseconds plus a small metadata hash. A single Lua script touches both
//! keys, so every check is atomic on one Redis server. All calls share one
//! reconnecting [`ConnectionManager`].

use std::sync::LazyLock;

use async_trait::async_trait;
use redis::Client as RedisClient;
use redis::aio::ConnectionManager;
use tracing::debug;
use uuid::Uuid;

use super::{StoreError, WindowCount, WindowSpec, WindowStore};

/// Keys scanned per SCAN round trip during a sweep.
const SCAN_BATCH: u64 = 500;

/// Pattern matching every timestamp set.
const TIMESTAMPS_PATTERN: &str = "rl:{*}:ts";

/// Prune, count, conditionally append, and touch metadata in one step.
///
/// KEYS[1] timestamp set, KEYS[2] metadata hash.
/// ARGV[1] now, ARGV[2] window, ARGV[3] max, ARGV[4] admission token.
///
/// A token already in the set was written by an earlier attempt of the same
/// check. It is not added again and is left out of the count and oldest.
const RECORD_AND_COUNT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - tonumber(ARGV[2]))
local mine = redis.call('ZSCORE', KEYS[1], ARGV[4])
local count = redis.call('ZCARD', KEYS[1])
local head = redis.call('ZRANGE', KEYS[1], 0, 1, 'WITHSCORES')
local oldest = head[2]
if mine then
    count = count - 1
    if head[1] == ARGV[4] then
        oldest = head[4]
    end
elseif count < tonumber(ARGV[3]) then
    redis.call('ZADD', KEYS[1], now, ARGV[4])
end
redis.call('HSETNX', KEYS[2], 'created_at', now)
redis.call('HSET', KEYS[2], 'last_updated', now)
if oldest then
    return {count, tonumber(oldest)}
end
return {count, false}
"#;

/// Delete a record only if its newest instant is still older than the cutoff.
///
/// KEYS[1] timestamp set, KEYS[2] metadata hash. ARGV[1] cutoff.
const PURGE_IF_IDLE_SCRIPT: &str = r#"
local newest = redis.call('ZRANGE', KEYS[1], -1, -1, 'WITHSCORES')
if newest[2] == nil or tonumber(newest[2]) < tonumber(ARGV[1]) then
    return redis.call('DEL', KEYS[1], KEYS[2]) > 0 and 1 or 0
end
return 0
"#;

static RECORD_AND_COUNT: LazyLock<redis::Script> =
    LazyLock::new(|| redis::Script::new(RECORD_AND_COUNT_SCRIPT));

static PURGE_IF_IDLE: LazyLock<redis::Script> =
    LazyLock::new(|| redis::Script::new(PURGE_IF_IDLE_SCRIPT));

/// Window store backed by Redis sorted sets.
#[derive(Clone)]
pub struct RedisWindowStore {
    conn: ConnectionManager,
}

impl RedisWindowStore {
    /// Open the shared connection and build the store.
    pub async fn connect(redis: RedisClient) -> Result<Self, StoreError> {
        let conn = ConnectionManager::new(redis).await?;
        Ok(Self { conn })
    }
}

/// Sorted-set key holding the timestamps of `key`.
fn timestamps_key(key: &str) -> String {
    format!("rl:{{{key}}}:ts")
}

/// Hash key holding `created_at` and `last_updated` of `key`.
fn meta_key(key: &str) -> String {
    format!("rl:{{{key}}}:meta")
}

/// Derive the metadata key from a scanned timestamp key.
fn meta_key_for(timestamps_key: &str) -> Option<String> {
    timestamps_key
        .strip_suffix(":ts")
        .map(|prefix| format!("{prefix}:meta"))
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn record_and_count(
        &self,
        key: &str,
        now_ms: i64,
        token: Uuid,
        spec: WindowSpec,
    ) -> Result<WindowCount, StoreError> {
        let mut conn = self.conn.clone();

        let (count, oldest_ms): (u64, Option<i64>) = RECORD_AND_COUNT
            .key(timestamps_key(key))
            .key(meta_key(key))
            .arg(now_ms)
            .arg(spec.window_ms)
            .arg(spec.max)
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowCount { count, oldest_ms })
    }

    async fn purge_idle(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();

        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(TIMESTAMPS_PATTERN)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            for ts_key in keys {
                let Some(meta) = meta_key_for(&ts_key) else {
                    continue;
                };
                let deleted: u64 = PURGE_IF_IDLE
                    .key(&ts_key)
                    .key(meta)
                    .arg(cutoff_ms)
                    .invoke_async(&mut conn)
                    .await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(removed = removed, "purged idle redis records");
        Ok(removed)
    }

    async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore").finish()
    }
}
