#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Common test utilities for integration tests.
//!
//! Tests drive the REAL router and limiters. Only the window store is
//! swapped: the memory backend, or a wrapper that records or injects
//! faults into store calls.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use tower::ServiceExt;

use tollgate_kernel::store::{
    MemoryWindowStore, RateLimitRecord, StoreError, WindowCount, WindowSpec, WindowStore,
};
use tollgate_kernel::{AppState, Config, build_router};
use tollgate_test_utils::{TestRequest, post};
use uuid::Uuid;

/// Admission key configured by [`config`].
pub const ADMISSION_KEY: &str = "test-admission-key";

/// An authorised `POST` to the admission route.
pub fn admission(uri: &str) -> TestRequest {
    post(uri).bearer(ADMISSION_KEY)
}

/// Build a config from test overrides. Retries back off by 1 ms so fault
/// tests stay fast.
pub fn config(vars: &[(&str, &str)]) -> Config {
    let mut map: HashMap<String, String> = HashMap::from([
        ("RATE_LIMIT_RETRY_BASE_MS".to_string(), "1".to_string()),
        ("RATE_LIMIT_STORE_TIMEOUT_MS".to_string(), "500".to_string()),
        ("CRON_KEY".to_string(), "test-cron-key".to_string()),
        ("ADMISSION_KEY".to_string(), ADMISSION_KEY.to_string()),
    ]);
    for (k, v) in vars {
        map.insert((*k).to_string(), (*v).to_string());
    }
    Config::from_lookup(|name| map.get(name).cloned()).expect("valid test config")
}

/// Test application wrapper using the REAL kernel routes and state.
pub struct TestApp {
    router: Router,
    pub state: AppState,
}

impl TestApp {
    /// App over a fresh memory store.
    pub fn new(vars: &[(&str, &str)]) -> Self {
        Self::with_store(vars, Arc::new(MemoryWindowStore::new()))
    }

    /// App over the given store.
    pub fn with_store(vars: &[(&str, &str)], store: Arc<dyn WindowStore>) -> Self {
        let state = AppState::with_store(config(vars), store);
        let router = build_router(state.clone());
        Self { router, state }
    }

    /// Send a request through the full router.
    pub async fn request(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

/// Store wrapper that records every key it is asked about.
#[derive(Debug, Default)]
pub struct RecordingStore {
    inner: MemoryWindowStore,
    calls: parking_lot::Mutex<Vec<String>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store calls made for keys starting with `prefix`.
    pub fn calls_for(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|k| k.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl WindowStore for RecordingStore {
    async fn record_and_count(
        &self,
        key: &str,
        now_ms: i64,
        token: Uuid,
        spec: WindowSpec,
    ) -> Result<WindowCount, StoreError> {
        self.calls.lock().push(key.to_string());
        self.inner.record_and_count(key, now_ms, token, spec).await
    }

    async fn purge_idle(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        self.inner.purge_idle(cutoff_ms).await
    }

    async fn ping(&self) -> bool {
        true
    }

    fn backend(&self) -> &'static str {
        "recording"
    }
}

/// Store whose calls for keys under `failing_prefix` always time out.
#[derive(Debug)]
pub struct FaultyStore {
    inner: MemoryWindowStore,
    failing_prefix: &'static str,
    attempts: AtomicU32,
}

impl FaultyStore {
    pub fn new(failing_prefix: &'static str) -> Self {
        Self {
            inner: MemoryWindowStore::new(),
            failing_prefix,
            attempts: AtomicU32::new(0),
        }
    }

    /// Failed attempts so far.
    pub fn failed_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WindowStore for FaultyStore {
    async fn record_and_count(
        &self,
        key: &str,
        now_ms: i64,
        token: Uuid,
        spec: WindowSpec,
    ) -> Result<WindowCount, StoreError> {
        if key.starts_with(self.failing_prefix) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Timeout(500));
        }
        self.inner.record_and_count(key, now_ms, token, spec).await
    }

    async fn purge_idle(&self, _cutoff_ms: i64) -> Result<u64, StoreError> {
        Err(StoreError::Timeout(500))
    }

    async fn ping(&self) -> bool {
        false
    }

    fn backend(&self) -> &'static str {
        "faulty"
    }
}

/// Store whose first call commits its write and then stalls for `stall`
/// before replying, as a slow network round trip would.
#[derive(Debug)]
pub struct LateReplyStore {
    inner: MemoryWindowStore,
    stall: Duration,
    stalled: AtomicBool,
    calls: AtomicU32,
}

impl LateReplyStore {
    pub fn new(stall: Duration) -> Self {
        Self {
            inner: MemoryWindowStore::new(),
            stall,
            stalled: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }

    /// Store calls made so far, retries included.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Snapshot of a stored record.
    pub fn get(&self, key: &str) -> Option<RateLimitRecord> {
        self.inner.get(key)
    }
}

#[async_trait]
impl WindowStore for LateReplyStore {
    async fn record_and_count(
        &self,
        key: &str,
        now_ms: i64,
        token: Uuid,
        spec: WindowSpec,
    ) -> Result<WindowCount, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.inner.record_and_count(key, now_ms, token, spec).await;
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.stall).await;
        }
        result
    }

    async fn purge_idle(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        self.inner.purge_idle(cutoff_ms).await
    }

    async fn ping(&self) -> bool {
        true
    }

    fn backend(&self) -> &'static str {
        "late-reply"
    }
}
