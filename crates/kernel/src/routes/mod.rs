//! HTTP route handlers.

pub mod admission;
pub mod cron;
pub mod health;
pub mod metrics;
pub mod whoami;

use axum::Router;
use subtle::ConstantTimeEq;

use crate::error::{AppError, AppResult};
use crate::middleware;
use crate::state::AppState;

/// Build the application router.
///
/// Operational routes sit outside the admission pipeline; API routes are
/// wrapped by [`middleware::protect`].
pub fn build_router(state: AppState) -> Router {
    let api = middleware::protect(whoami::router(), &state);

    Router::new()
        .merge(api)
        .merge(admission::router())
        .merge(health::router())
        .merge(metrics::router())
        .merge(cron::router())
        .with_state(state)
}

/// Compare a caller-supplied secret against the configured one in constant
/// time. An unset secret refuses every caller.
pub(crate) fn require_secret(provided: Option<&str>, expected: Option<&str>) -> AppResult<()> {
    let (Some(provided), Some(expected)) = (provided, expected) else {
        return Err(AppError::Forbidden);
    };

    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}
