//! Application state shared across all handlers.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use redis::Client as RedisClient;
use tracing::info;

use crate::config::{Config, StoreBackend};
use crate::limiter::{Scope, ScopedLimiter};
use crate::metrics::Metrics;
use crate::store::{MemoryWindowStore, PgWindowStore, RedisWindowStore, WindowStore};
use crate::sweeper::SweeperService;

/// Shared application state.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Configuration, fixed for the process lifetime.
    config: Config,

    /// The window store every limiter and the sweeper share.
    store: Arc<dyn WindowStore>,

    /// Client-address limiter.
    ip_limiter: ScopedLimiter,

    /// Verified-identity limiter.
    fingerprint_limiter: ScopedLimiter,

    /// Idle record sweeper.
    sweeper: SweeperService,

    /// Prometheus metrics.
    metrics: Arc<Metrics>,
}

impl AppState {
    /// Create new application state, connecting the configured backend.
    pub async fn new(config: &Config) -> Result<Self> {
        let store = open_store(config).await?;
        info!(backend = store.backend(), "window store ready");
        Ok(Self::with_store(config.clone(), store))
    }

    /// Create application state over an existing store.
    pub fn with_store(config: Config, store: Arc<dyn WindowStore>) -> Self {
        let metrics = Arc::new(Metrics::new());
        let policy = config.contention_policy();

        let ip_limiter = ScopedLimiter::new(
            Scope::Ip,
            config.scope(Scope::Ip),
            store.clone(),
            policy.clone(),
            metrics.clone(),
        );
        let fingerprint_limiter = ScopedLimiter::new(
            Scope::Fingerprint,
            config.scope(Scope::Fingerprint),
            store.clone(),
            policy,
            metrics.clone(),
        );
        let sweeper = SweeperService::new(store.clone(), config.sweep_retention, metrics.clone());

        Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                ip_limiter,
                fingerprint_limiter,
                sweeper,
                metrics,
            }),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the window store.
    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.inner.store
    }

    /// Get the client-address limiter.
    pub fn ip_limiter(&self) -> &ScopedLimiter {
        &self.inner.ip_limiter
    }

    /// Get the verified-identity limiter.
    pub fn fingerprint_limiter(&self) -> &ScopedLimiter {
        &self.inner.fingerprint_limiter
    }

    /// Get the limiter for `scope`.
    pub fn limiter(&self, scope: Scope) -> &ScopedLimiter {
        match scope {
            Scope::Ip => self.ip_limiter(),
            Scope::Fingerprint => self.fingerprint_limiter(),
        }
    }

    /// Get the sweeper.
    pub fn sweeper(&self) -> &SweeperService {
        &self.inner.sweeper
    }

    /// Get the metrics.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Check store health.
    pub async fn store_healthy(&self) -> bool {
        self.inner.store.ping().await
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("backend", &self.inner.store.backend())
            .finish()
    }
}

/// Connect the window store named by `STORE_BACKEND`.
async fn open_store(config: &Config) -> Result<Arc<dyn WindowStore>> {
    let store: Arc<dyn WindowStore> = match config.store_backend {
        StoreBackend::Memory => Arc::new(MemoryWindowStore::new()),
        StoreBackend::Redis => {
            let redis = RedisClient::open(config.redis_url.as_str())
                .context("failed to create Redis client")?;
            let store = RedisWindowStore::connect(redis)
                .await
                .context("failed to connect to Redis")?;

            // Test Redis connection
            if !store.ping().await {
                bail!("Redis PING failed");
            }
            Arc::new(store)
        }
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres backend")?;
            let store = PgWindowStore::connect(url, config.database_max_connections)
                .await
                .context("failed to connect PostgreSQL window store")?;
            Arc::new(store)
        }
    };
    Ok(store)
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_state() {
        let config = Config::from_lookup(|_| None).unwrap();
        let state = AppState::new(&config).await.unwrap();

        assert_eq!(state.store().backend(), "memory");
        assert!(state.store_healthy().await);
        assert_eq!(state.limiter(Scope::Ip).scope(), Scope::Ip);
        assert_eq!(
            state.limiter(Scope::Fingerprint).config().max,
            config.fingerprint.max
        );
    }
}
