//! Tollgate Load Testing Tool
//!
//! Hammers a single rate limit key from many concurrent workers and checks
//! that the server never admits more than the quota within one window.
//!
//! Usage:
//!   cargo run -p tollgate-loadtest -- --base-url http://localhost:3000 \
//!       --quota 100 --window-ms 60000 --workers 64 --duration 10

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;

/// Load test configuration.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the Tollgate server.
    #[arg(long, default_value = "http://localhost:3000")]
    base_url: String,

    /// Scope to exercise (`ip` or `fingerprint`).
    #[arg(long, default_value = "ip")]
    scope: String,

    /// Server `ADMISSION_KEY`, sent as a bearer token.
    #[arg(long)]
    admission_key: String,

    /// Identifier to hammer. A random one is generated when omitted.
    #[arg(long)]
    identifier: Option<String>,

    /// Quota configured on the server for this scope.
    #[arg(long, default_value = "100")]
    quota: u64,

    /// Window configured on the server for this scope, in milliseconds.
    #[arg(long, default_value = "60000")]
    window_ms: u64,

    /// Number of concurrent workers.
    #[arg(long, default_value = "64")]
    workers: usize,

    /// Test duration in seconds.
    #[arg(long, default_value = "10")]
    duration: u64,

    /// Pause between requests per worker in milliseconds.
    #[arg(long, default_value = "0")]
    think_time: u64,
}

/// Load test statistics.
#[derive(Debug, Clone, Serialize)]
struct Stats {
    total_requests: u64,
    admitted: u64,
    rejected: u64,
    refused: u64,
    faults: u64,
    transport_errors: u64,
    p50_latency_ms: u64,
    p95_latency_ms: u64,
    p99_latency_ms: u64,
    requests_per_second: f64,
    window_violations: usize,
}

/// Admission observed by the client: the server decided somewhere between
/// `sent` and `received`.
#[derive(Debug, Clone, Copy)]
struct Admit {
    sent: Duration,
    received: Duration,
}

/// Atomic counters for thread-safe statistics.
struct AtomicStats {
    total_requests: AtomicU64,
    rejected: AtomicU64,
    refused: AtomicU64,
    faults: AtomicU64,
    transport_errors: AtomicU64,
    admits: parking_lot::Mutex<Vec<Admit>>,
    latencies: parking_lot::Mutex<Vec<u64>>,
}

impl AtomicStats {
    fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            admits: parking_lot::Mutex::new(Vec::new()),
            latencies: parking_lot::Mutex::new(Vec::with_capacity(100_000)),
        }
    }

    fn record(&self, status: Option<u16>, admit: Admit) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        match status {
            Some(200) => self.admits.lock().push(admit),
            Some(429) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
            Some(403) => {
                self.refused.fetch_add(1, Ordering::Relaxed);
            }
            Some(_) => {
                self.faults.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.transport_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        let latency = admit.received.saturating_sub(admit.sent);
        self.latencies.lock().push(latency.as_millis() as u64);
    }

    fn compute_stats(&self, elapsed: Duration, quota: u64, window: Duration) -> Stats {
        let mut latencies = self.latencies.lock().clone();
        latencies.sort_unstable();

        let percentile = |p: f64| -> u64 {
            if latencies.is_empty() {
                return 0;
            }
            let idx = ((latencies.len() as f64 * p) as usize).min(latencies.len() - 1);
            latencies[idx]
        };

        let mut admits = self.admits.lock().clone();
        admits.sort_by_key(|a| a.sent);

        let total = self.total_requests.load(Ordering::Relaxed);
        Stats {
            total_requests: total,
            admitted: admits.len() as u64,
            rejected: self.rejected.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            p50_latency_ms: percentile(0.5),
            p95_latency_ms: percentile(0.95),
            p99_latency_ms: percentile(0.99),
            requests_per_second: total as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
            window_violations: window_violations(&admits, quota, window),
        }
    }
}

/// Count runs of `quota + 1` admissions that certainly fell inside one window.
///
/// `admits` must be sorted by `sent`. A run is a certain violation only if
/// the last response arrived less than a window after the first request
/// was sent, so network latency can only hide violations, never invent them.
fn window_violations(admits: &[Admit], quota: u64, window: Duration) -> usize {
    let span = quota as usize;
    admits
        .windows(span + 1)
        .filter(|run| {
            let first_sent = run[0].sent;
            let last_received = run.iter().map(|a| a.received).max().unwrap_or(first_sent);
            last_received.saturating_sub(first_sent) < window
        })
        .count()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.quota == 0 {
        bail!("--quota must be positive");
    }

    let identifier = args
        .identifier
        .clone()
        .unwrap_or_else(|| format!("loadtest-{:08x}", rand::thread_rng().r#gen::<u32>()));
    let url = format!("{}/admission/{}/{}", args.base_url, args.scope, identifier);

    println!("Tollgate Load Test");
    println!("==================");
    println!("Target:   {url}");
    println!("Quota:    {} per {} ms", args.quota, args.window_ms);
    println!("Workers:  {}", args.workers);
    println!("Duration: {} seconds", args.duration);
    println!();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to create HTTP client")?;

    println!("Checking server connectivity...");
    let health = client
        .get(format!("{}/health", args.base_url))
        .send()
        .await
        .context("failed to connect to server")?;
    if !health.status().is_success() {
        bail!("server returned error status: {}", health.status());
    }
    println!("Server is healthy\n");

    let stats = Arc::new(AtomicStats::new());
    let origin = Instant::now();
    let test_duration = Duration::from_secs(args.duration);

    println!("Starting load test...");

    let handles = (0..args.workers).map(|_| {
        let request = client.post(&url).bearer_auth(&args.admission_key);
        let stats = stats.clone();
        let think_time = Duration::from_millis(args.think_time);
        tokio::spawn(run_worker(request, stats, origin, test_duration, think_time))
    });
    join_all(handles).await;

    let elapsed = origin.elapsed();
    let window = Duration::from_millis(args.window_ms);
    let results = stats.compute_stats(elapsed, args.quota, window);

    println!("\nTest completed in {:.2} seconds", elapsed.as_secs_f64());
    println!("\nResults");
    println!("=======");
    println!("{}", serde_json::to_string_pretty(&results)?);
    println!();

    if results.refused > 0 {
        bail!("server refused {} checks: wrong --admission-key", results.refused);
    }

    if results.window_violations == 0 {
        println!(
            "PASS: never more than {} admissions within {} ms",
            args.quota, args.window_ms
        );
    } else {
        println!(
            "FAIL: {} runs of {} admissions inside one {} ms window",
            results.window_violations,
            args.quota + 1,
            args.window_ms
        );
    }

    if results.faults > 0 {
        println!("WARN: {} fault responses", results.faults);
    }

    if results.window_violations > 0 {
        bail!("quota exceeded under concurrent load");
    }
    Ok(())
}

/// Send admission checks back to back until the duration elapses.
async fn run_worker(
    request: reqwest::RequestBuilder,
    stats: Arc<AtomicStats>,
    origin: Instant,
    duration: Duration,
    think_time: Duration,
) {
    while origin.elapsed() < duration {
        let Some(attempt) = request.try_clone() else {
            return;
        };
        let sent = origin.elapsed();
        let status = attempt
            .send()
            .await
            .ok()
            .map(|resp| resp.status().as_u16());
        let received = origin.elapsed();

        stats.record(status, Admit { sent, received });

        if !think_time.is_zero() {
            tokio::time::sleep(think_time).await;
        }
    }
}
