//! Configuration loaded from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::limiter::{ContentionPolicy, FaultMode, Scope, ScopeConfig};

/// Which window store backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
    Postgres,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            other => bail!("unknown STORE_BACKEND {other:?} (expected memory, redis, or postgres)"),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 3000).
    pub port: u16,

    /// Window store backend (default: memory).
    pub store_backend: StoreBackend,

    /// Redis connection URL.
    pub redis_url: String,

    /// PostgreSQL connection URL, required for the postgres backend.
    pub database_url: Option<String>,

    /// Maximum database connections in pool (default: 10).
    pub database_max_connections: u32,

    /// Limits for the client-address scope.
    pub ip: ScopeConfig,

    /// Limits for the verified-identity scope.
    pub fingerprint: ScopeConfig,

    /// Admit requests when the store stays unhealthy (default: true).
    pub fail_open: bool,

    /// Total store attempts per check (default: 3).
    pub retry_attempts: u32,

    /// Backoff base; the delay after attempt n is base × 2^n (default: 100 ms).
    pub retry_base: Duration,

    /// Per-attempt store timeout (default: 2 s).
    pub store_timeout: Duration,

    /// Records idle longer than this are swept (default: 30 days).
    pub sweep_retention: Duration,

    /// Secret path segment authorising sweeps. Sweeps are refused when unset.
    pub cron_key: Option<String>,

    /// Bearer secret authorising `/admission` calls. Refused when unset.
    pub admission_key: Option<String>,

    /// Header carrying the identity verified by the upstream authenticator.
    pub identity_header: String,

    /// CORS allowed origins (comma-separated, default: "*").
    pub cors_allowed_origins: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let port = var("PORT", "3000")
            .parse()
            .context("PORT must be a valid u16")?;

        let store_backend: StoreBackend = var("STORE_BACKEND", "memory").parse()?;

        let redis_url = var("REDIS_URL", "redis://127.0.0.1:6379");

        let database_url = lookup("DATABASE_URL").filter(|v| !v.is_empty());
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            bail!("DATABASE_URL environment variable is required for the postgres backend");
        }

        let database_max_connections = var("DATABASE_MAX_CONNECTIONS", "10")
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be a valid u32")?;

        let ip = scope_config(&lookup, Scope::Ip, 60_000, 100)?;
        let fingerprint = scope_config(&lookup, Scope::Fingerprint, 60_000, 60)?;

        let fail_open = parse_bool(&var("RATE_LIMIT_FAIL_OPEN", "true"))
            .context("RATE_LIMIT_FAIL_OPEN must be true or false")?;

        let retry_attempts: u32 = var("RATE_LIMIT_RETRY_ATTEMPTS", "3")
            .parse()
            .context("RATE_LIMIT_RETRY_ATTEMPTS must be a valid u32")?;
        if retry_attempts == 0 {
            bail!("RATE_LIMIT_RETRY_ATTEMPTS must be at least 1");
        }

        let retry_base = Duration::from_millis(
            var("RATE_LIMIT_RETRY_BASE_MS", "100")
                .parse()
                .context("RATE_LIMIT_RETRY_BASE_MS must be a valid u64")?,
        );

        let store_timeout_ms: u64 = var("RATE_LIMIT_STORE_TIMEOUT_MS", "2000")
            .parse()
            .context("RATE_LIMIT_STORE_TIMEOUT_MS must be a valid u64")?;
        if store_timeout_ms == 0 {
            bail!("RATE_LIMIT_STORE_TIMEOUT_MS must be positive");
        }

        let retention_days: u64 = var("SWEEP_RETENTION_DAYS", "30")
            .parse()
            .context("SWEEP_RETENTION_DAYS must be a valid u64")?;
        if retention_days == 0 {
            bail!("SWEEP_RETENTION_DAYS must be positive");
        }

        let cron_key = lookup("CRON_KEY").filter(|v| !v.is_empty());
        let admission_key = lookup("ADMISSION_KEY").filter(|v| !v.is_empty());

        let identity_header = var("IDENTITY_HEADER", "x-verified-fingerprint").to_lowercase();
        axum::http::HeaderName::from_bytes(identity_header.as_bytes())
            .context("IDENTITY_HEADER must be a valid header name")?;

        let cors_allowed_origins = var("CORS_ALLOWED_ORIGINS", "*")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            port,
            store_backend,
            redis_url,
            database_url,
            database_max_connections,
            ip,
            fingerprint,
            fail_open,
            retry_attempts,
            retry_base,
            store_timeout: Duration::from_millis(store_timeout_ms),
            sweep_retention: Duration::from_secs(retention_days * 24 * 60 * 60),
            cron_key,
            admission_key,
            identity_header,
            cors_allowed_origins,
        })
    }

    /// Limits configured for `scope`.
    pub fn scope(&self, scope: Scope) -> ScopeConfig {
        match scope {
            Scope::Ip => self.ip,
            Scope::Fingerprint => self.fingerprint,
        }
    }

    /// Contention policy built from the retry settings.
    pub fn contention_policy(&self) -> ContentionPolicy {
        ContentionPolicy::new(
            self.retry_attempts,
            self.retry_base,
            self.store_timeout,
            FaultMode::from_fail_open(self.fail_open),
        )
    }
}

/// Read `RATE_LIMIT_<SCOPE>_{WINDOW_MS,MAX,ENABLED}`.
///
/// Window and quota are validated even for a disabled scope so a bad value
/// never lies dormant until someone flips the toggle.
fn scope_config<F>(lookup: &F, scope: Scope, window_ms: u64, max: u64) -> Result<ScopeConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = format!("RATE_LIMIT_{}", scope.as_str().to_uppercase());

    let window_ms = positive(lookup, &format!("{prefix}_WINDOW_MS"), window_ms)?;
    let max = positive(lookup, &format!("{prefix}_MAX"), max)?;

    let enabled_var = format!("{prefix}_ENABLED");
    let enabled = match lookup(&enabled_var) {
        Some(v) => parse_bool(&v).with_context(|| format!("{enabled_var} must be true or false"))?,
        None => true,
    };

    Ok(ScopeConfig {
        window_ms,
        max,
        enabled,
    })
}

fn positive<F>(lookup: &F, name: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    let value: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{name} must be a positive integer, got {raw:?}"))?;
    if value == 0 {
        bail!("{name} must be a positive integer, got 0");
    }
    Ok(value)
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("invalid boolean {other:?}"),
    }
}
