//! Rate limiting middleware.
//!
//! The `ip` limiter runs on every request; the `fingerprint` limiter runs
//! once an identity is known. A rejection from either ends the request.

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::trace;

use super::client_key::{ClientIp, client_ip, verified_identity};
use crate::limiter::{Admission, Rejection};
use crate::state::AppState;

/// Body returned for a 429 or a fail-closed 500.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RejectionBody {
    success: bool,
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::QuotaExceeded {
                retry_after_secs, ..
            } => rate_limit_response(retry_after_secs),
            Rejection::Fault { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RejectionBody {
                    success: false,
                    error: "Rate limit check failed",
                    retry_after: None,
                }),
            )
                .into_response(),
        }
    }
}

/// Rate limit exceeded response.
pub fn rate_limit_response(retry_after: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after.to_string())],
        Json(RejectionBody {
            success: false,
            error: "Too many requests, please try again later",
            retry_after: Some(retry_after),
        }),
    )
        .into_response()
}

/// Client-address limiter. Always applicable.
pub async fn limit_by_ip(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_ip(&request);

    match state.ip_limiter().check(&ip).await {
        Admission::Proceed { remaining } => {
            trace!(ip = %ip, remaining = ?remaining, "ip check passed");
            request.extensions_mut().insert(ClientIp(ip));
            next.run(request).await
        }
        Admission::Rejected(rejection) => rejection.into_response(),
    }
}

/// Verified-identity limiter. Skipped when no identity is established.
pub async fn limit_by_fingerprint(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(identity) = verified_identity(&request).map(str::to_string) else {
        return next.run(request).await;
    };

    match state.fingerprint_limiter().check(&identity).await {
        Admission::Proceed { remaining } => {
            trace!(identity = %identity, remaining = ?remaining, "fingerprint check passed");
            next.run(request).await
        }
        Admission::Rejected(rejection) => rejection.into_response(),
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;
    use crate::limiter::Scope;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_quota_exceeded_response() {
        let response = Rejection::QuotaExceeded {
            scope: Scope::Ip,
            retry_after_secs: 7,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "7");

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Too many requests, please try again later");
        assert_eq!(body["retryAfter"], 7);
    }

    #[tokio::test]
    async fn test_fault_response_has_no_retry_hint() {
        let response = Rejection::Fault {
            scope: Scope::Fingerprint,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Rate limit check failed");
        assert!(body.get("retryAfter").is_none());
    }
}
