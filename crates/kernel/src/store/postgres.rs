//! PostgreSQL window store using optimistic concurrency.
//!
//! A check reads the row and its `version`, applies the window in memory, and
//! writes back only if `version` is unchanged. A lost race surfaces as
//! [`StoreError::Conflict`] and is retried by the caller's contention policy.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;
use uuid::Uuid;

use super::{RateLimitRecord, StoreError, WindowCount, WindowEntry, WindowSpec, WindowStore};

/// Row shape: timestamps, tokens, version, created_at, last_updated.
type RecordRow = (Vec<i64>, Vec<Uuid>, i64, i64, i64);

/// Rebuild the entries from the two parallel columns.
fn entries_from_columns(
    key: &str,
    timestamps: Vec<i64>,
    tokens: Vec<Uuid>,
) -> Result<Vec<WindowEntry>, StoreError> {
    if timestamps.len() != tokens.len() {
        return Err(StoreError::Malformed(format!(
            "{key} has {} timestamps but {} tokens",
            timestamps.len(),
            tokens.len()
        )));
    }
    if !timestamps.is_sorted() {
        return Err(StoreError::Malformed(format!(
            "timestamps for {key} are not in ascending order"
        )));
    }
    Ok(timestamps
        .into_iter()
        .zip(tokens)
        .map(|(at_ms, token)| WindowEntry { at_ms, token })
        .collect())
}

/// Split entries into the `timestamps` and `tokens` columns.
fn columns_from_entries(entries: &[WindowEntry]) -> (Vec<i64>, Vec<Uuid>) {
    entries.iter().map(|e| (e.at_ms, e.token)).unzip()
}

/// Window store backed by the `rate_limit_records` table.
#[derive(Clone)]
pub struct PgWindowStore {
    pool: PgPool,
}

impl PgWindowStore {
    /// Wrap an existing pool. The schema must already be migrated.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, run pending migrations, and build the store.
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to PostgreSQL")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run rate limit migrations")?;

        Ok(Self::new(pool))
    }

    /// Insert a brand-new record. Losing the insert race is a conflict.
    async fn insert(
        &self,
        key: &str,
        now_ms: i64,
        token: Uuid,
        spec: WindowSpec,
    ) -> Result<WindowCount, StoreError> {
        let mut record = RateLimitRecord::new(key, now_ms);
        let result = record.apply(now_ms, token, spec);
        let (timestamps, tokens) = columns_from_entries(&record.entries);

        let inserted = sqlx::query(
            r#"
            INSERT INTO rate_limit_records (key, timestamps, tokens, version, created_at, last_updated)
            VALUES ($1, $2, $3, 1, $4, $4)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(&timestamps)
        .bind(&tokens)
        .bind(now_ms)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(StoreError::Conflict(key.to_string()));
        }
        Ok(result)
    }
}

#[async_trait]
impl WindowStore for PgWindowStore {
    async fn record_and_count(
        &self,
        key: &str,
        now_ms: i64,
        token: Uuid,
        spec: WindowSpec,
    ) -> Result<WindowCount, StoreError> {
        let row: Option<RecordRow> = sqlx::query_as(
            "SELECT timestamps, tokens, version, created_at, last_updated FROM rate_limit_records WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some((timestamps, tokens, version, created_at, last_updated)) = row else {
            return self.insert(key, now_ms, token, spec).await;
        };

        let mut record = RateLimitRecord {
            key: key.to_string(),
            entries: entries_from_columns(key, timestamps, tokens)?,
            created_at,
            last_updated,
        };
        let result = record.apply(now_ms, token, spec);
        let (timestamps, tokens) = columns_from_entries(&record.entries);

        let updated = sqlx::query(
            r#"
            UPDATE rate_limit_records
            SET timestamps = $2, tokens = $3, version = version + 1, last_updated = $4
            WHERE key = $1 AND version = $5
            "#,
        )
        .bind(key)
        .bind(&timestamps)
        .bind(&tokens)
        .bind(record.last_updated)
        .bind(version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            debug!(key = %key, version = version, "optimistic update lost race");
            return Err(StoreError::Conflict(key.to_string()));
        }
        Ok(result)
    }

    async fn purge_idle(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM rate_limit_records
            WHERE COALESCE(timestamps[array_upper(timestamps, 1)], last_updated) < $1
            "#,
        )
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await?;

        debug!(removed = result.rows_affected(), "purged idle postgres records");
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

impl std::fmt::Debug for PgWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgWindowStore").finish()
    }
}
