//! HTTP middleware components.
//!
//! Key resolution and the two admission limiters, plus [`protect`] which
//! wires them around a router in pipeline order.

pub mod client_key;
pub mod rate_limit;

pub use client_key::{
    ClientIp, VerifiedIdentity, client_ip, extract_upstream_identity, get_client_id,
    verified_identity,
};
pub use rate_limit::{limit_by_fingerprint, limit_by_ip, rate_limit_response};

use axum::Router;
use axum::middleware::from_fn_with_state;

use crate::state::AppState;

/// Wrap `router` in the admission pipeline.
///
/// Layers run last-added first, so a request flows
/// ip limiter → identity extraction → fingerprint limiter → routes.
pub fn protect(router: Router<AppState>, state: &AppState) -> Router<AppState> {
    router
        .layer(from_fn_with_state(state.clone(), limit_by_fingerprint))
        .layer(from_fn_with_state(state.clone(), extract_upstream_identity))
        .layer(from_fn_with_state(state.clone(), limit_by_ip))
}
