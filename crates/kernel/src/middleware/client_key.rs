//! Rate-limit key resolution.
//!
//! The `ip` scope is always resolvable; the `fingerprint` scope applies only
//! once an upstream authentication step has established who the caller is.

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use tracing::trace;

use crate::state::AppState;

/// Client address resolved for the `ip` scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

/// Caller identity verified by an upstream authentication step.
///
/// In-process authentication middleware may insert this extension directly;
/// otherwise [`extract_upstream_identity`] derives it from the configured
/// identity header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity(pub String);

/// Get the client identifier (IP address) for rate limiting.
pub fn get_client_id(addr: Option<SocketAddr>, headers: &HeaderMap) -> String {
    // Check X-Forwarded-For header first (for proxied requests)
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(ip) = value.split(',').next().map(str::trim)
        && !ip.is_empty()
    {
        // Take the first IP in the chain
        return ip.to_string();
    }

    // Check X-Real-IP header
    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return value.trim().to_string();
    }

    // Fall back to connection address
    addr.map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Resolve the `ip` scope identifier for a request.
pub fn client_ip(request: &Request<Body>) -> String {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    get_client_id(peer, request.headers())
}

/// Resolve the `fingerprint` scope identifier, if identity is established.
pub fn verified_identity(request: &Request<Body>) -> Option<&str> {
    request
        .extensions()
        .get::<VerifiedIdentity>()
        .map(|VerifiedIdentity(id)| id.as_str())
        .filter(|id| !id.is_empty())
}

/// Middleware that trusts the identity header set by the upstream authenticator.
///
/// The header must be stripped from client traffic by whatever sits in front
/// of this service; it is taken at face value here. An identity already
/// present in the request extensions wins over the header.
pub async fn extract_upstream_identity(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if request.extensions().get::<VerifiedIdentity>().is_none() {
        let identity = request
            .headers()
            .get(state.config().identity_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        if let Some(identity) = identity {
            trace!(identity = %identity, "upstream identity established");
            request.extensions_mut().insert(VerifiedIdentity(identity));
        }
    }

    next.run(request).await
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn peer() -> Option<SocketAddr> {
        Some("198.51.100.7:54321".parse().unwrap())
    }

    #[test]
    fn test_forwarded_chain_uses_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1, 10.0.0.2"),
        );
        assert_eq!(get_client_id(peer(), &headers), "203.0.113.9");
    }

    #[test]
    fn test_real_ip_when_no_forwarded_chain() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.10"));
        assert_eq!(get_client_id(peer(), &headers), "203.0.113.10");
    }

    #[test]
    fn test_empty_forwarded_header_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" , 10.0.0.1"));
        assert_eq!(get_client_id(peer(), &headers), "198.51.100.7");
    }

    #[test]
    fn test_always_resolvable() {
        assert_eq!(get_client_id(None, &HeaderMap::new()), "unknown");
    }

    #[test]
    fn test_identity_absent_on_public_request() {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(verified_identity(&request), None);

        let mut request = Request::builder().uri("/").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(VerifiedIdentity("fp-123".into()));
        assert_eq!(verified_identity(&request), Some("fp-123"));
    }

    #[test]
    fn test_client_ip_reads_connect_info() {
        let mut request = Request::builder().uri("/").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("192.0.2.44:8000".parse().unwrap()));
        assert_eq!(client_ip(&request), "192.0.2.44");
    }
}
