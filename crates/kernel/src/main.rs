//! Tollgate Kernel
//!
//! Admission control server and sweeper CLI.

use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use axum::http::{HeaderValue, Method};
use clap::{Parser, Subcommand};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tollgate_kernel::sweeper::SweepResult;
use tollgate_kernel::{AppState, Config, build_router};

#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about = "Dual sliding-window rate limiter")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default).
    Serve,
    /// Run one cleanup sweep against the configured store and exit.
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize tracing
    init_tracing();

    // Load configuration from environment
    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        port = config.port,
        backend = ?config.store_backend,
        "Configuration loaded"
    );

    // Initialize application state (window store connection, limiters)
    let state = AppState::new(&config)
        .await
        .context("failed to initialize application state")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config, state).await,
        Command::Sweep => sweep(state).await,
    }
}

async fn serve(config: &Config, state: AppState) -> Result<()> {
    info!(
        ip_enabled = config.ip.enabled,
        ip_max = config.ip.max,
        ip_window_ms = config.ip.window_ms,
        fingerprint_enabled = config.fingerprint.enabled,
        fingerprint_max = config.fingerprint.max,
        fingerprint_window_ms = config.fingerprint.window_ms,
        fail_open = config.fail_open,
        "Starting Tollgate"
    );

    // Build CORS layer from config
    let cors = build_cors_layer(config);

    // Middleware layers (last added = first executed in request flow):
    // TraceLayer → CORS → routes (admission pipeline wraps API routes)
    let app = build_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind to address")?;

    info!(%addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("Server stopped");
    Ok(())
}

async fn sweep(state: AppState) -> Result<()> {
    match state.sweeper().run().await {
        SweepResult::Completed {
            deleted,
            duration_ms,
        } => {
            info!(deleted, duration_ms, "sweep finished");
            Ok(())
        }
        SweepResult::Skipped => Ok(()),
        SweepResult::Failed(error) => bail!("sweep failed: {error}"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

fn build_cors_layer(config: &Config) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::OPTIONS];

    if config.cors_allowed_origins.len() == 1 && config.cors_allowed_origins[0] == "*" {
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(methods)
            .allow_headers(tower_http::cors::Any)
            .expose_headers([axum::http::header::RETRY_AFTER])
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_allowed_origins
            .iter()
            .filter_map(|o| match o.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(origin = %o, "ignoring unparseable CORS origin");
                    None
                }
            })
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(tower_http::cors::Any)
            .expose_headers([axum::http::header::RETRY_AFTER])
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
