//! Cron route handlers.
//!
//! An external scheduler drives the cleanup sweeper through these routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tracing::info;

use super::require_secret;
use crate::error::AppResult;
use crate::state::AppState;
use crate::sweeper::{LastSweep, SweepResult};

/// Create the cron router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/cron/{key}", post(run_sweep))
        .route("/cron/{key}/status", get(sweep_status))
}

/// Sweep run response.
#[derive(Debug, Serialize)]
pub struct CronResponse {
    pub status: String,
    pub deleted: Option<u64>,
    pub duration_ms: Option<u64>,
    pub message: Option<String>,
}

/// Sweep status response.
#[derive(Debug, Serialize)]
pub struct CronStatusResponse {
    pub retention_days: u64,
    pub last_run: Option<LastRunInfo>,
}

/// Last run information.
#[derive(Debug, Serialize)]
pub struct LastRunInfo {
    #[serde(flatten)]
    pub run: LastSweep,
    pub time_ago: String,
}

/// Validate the cron key. Sweeps are refused outright when no key is set.
fn authorize(state: &AppState, key: &str) -> AppResult<()> {
    require_secret(Some(key), state.config().cron_key.as_deref()).inspect_err(|_| {
        info!("cron call refused");
    })
}

/// Run the sweeper (protected by secret key).
async fn run_sweep(State(state): State<AppState>, Path(key): Path<String>) -> AppResult<Response> {
    authorize(&state, &key)?;

    info!("sweep triggered via HTTP");
    let response = match state.sweeper().run().await {
        SweepResult::Completed {
            deleted,
            duration_ms,
        } => (
            StatusCode::OK,
            Json(CronResponse {
                status: "completed".to_string(),
                deleted: Some(deleted),
                duration_ms: Some(duration_ms),
                message: None,
            }),
        ),
        SweepResult::Skipped => (
            StatusCode::OK,
            Json(CronResponse {
                status: "skipped".to_string(),
                deleted: None,
                duration_ms: None,
                message: Some("A sweep is already running".to_string()),
            }),
        ),
        SweepResult::Failed(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(CronResponse {
                status: "failed".to_string(),
                deleted: None,
                duration_ms: None,
                message: Some(error),
            }),
        ),
    };

    Ok(response.into_response())
}

/// Report the last sweep run by this instance.
async fn sweep_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> AppResult<Json<CronStatusResponse>> {
    authorize(&state, &key)?;

    let last_run = state.sweeper().last_run().map(|run| {
        let seconds_ago = chrono::Utc::now().timestamp() - run.timestamp;
        LastRunInfo {
            time_ago: time_ago(seconds_ago),
            run,
        }
    });

    Ok(Json(CronStatusResponse {
        retention_days: state.sweeper().retention().as_secs() / 86_400,
        last_run,
    }))
}

fn time_ago(seconds_ago: i64) -> String {
    if seconds_ago < 60 {
        format!("{seconds_ago} seconds ago")
    } else if seconds_ago < 3600 {
        format!("{} minutes ago", seconds_ago / 60)
    } else if seconds_ago < 86400 {
        format!("{} hours ago", seconds_ago / 3600)
    } else {
        format!("{} days ago", seconds_ago / 86400)
    }
}
