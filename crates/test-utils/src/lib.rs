#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Tollgate test utilities.
//!
//! Request builders for driving an axum router with `oneshot`, plus
//! response decoding and assertion helpers for the JSON bodies the
//! admission layer returns.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Method, Request, Response, header};
use http_body_util::BodyExt;
use serde_json::Value as JsonValue;

/// Default identity header used by the kernel configuration.
pub const IDENTITY_HEADER: &str = "x-verified-fingerprint";

/// Start a GET request.
pub fn get(uri: &str) -> TestRequest {
    TestRequest::new(Method::GET, uri)
}

/// Start a POST request.
pub fn post(uri: &str) -> TestRequest {
    TestRequest::new(Method::POST, uri)
}

/// A request builder for integration tests.
#[derive(Debug, Clone)]
pub struct TestRequest {
    pub method: Method,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub peer: Option<SocketAddr>,
}

impl TestRequest {
    pub fn new(method: Method, uri: &str) -> Self {
        Self {
            method,
            uri: uri.to_string(),
            headers: Vec::new(),
            peer: None,
        }
    }

    /// Add an arbitrary header.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Arrive through a proxy that reports `ip` as the client.
    pub fn forwarded_for(self, ip: &str) -> Self {
        self.header("x-forwarded-for", ip)
    }

    /// Carry an identity established by the upstream authenticator.
    pub fn identity(self, fingerprint: &str) -> Self {
        self.header(IDENTITY_HEADER, fingerprint)
    }

    /// Authenticate with `Authorization: Bearer <token>`.
    pub fn bearer(self, token: &str) -> Self {
        self.header("authorization", &format!("Bearer {token}"))
    }

    /// Set the transport-level peer address.
    pub fn peer(mut self, addr: &str) -> Self {
        self.peer = Some(addr.parse().expect("valid socket address"));
        self
    }

    /// Build the request.
    pub fn build(self) -> Request<Body> {
        let mut builder = Request::builder().method(self.method).uri(self.uri);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let mut request = builder.body(Body::empty()).expect("valid request");
        if let Some(peer) = self.peer {
            request.extensions_mut().insert(ConnectInfo(peer));
        }
        request
    }
}

/// Read the response body as JSON.
pub async fn body_json(response: Response<Body>) -> JsonValue {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("readable body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("JSON body")
}

/// Read the response body as text.
pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("readable body")
        .to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// The `Retry-After` header in seconds, if present.
pub fn retry_after<B>(response: &Response<B>) -> Option<u64> {
    response
        .headers()
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Assertion helpers for JSON content.
pub mod assert {
    use serde_json::Value;

    /// Assert that a JSON value has a specific key.
    pub fn has_key(value: &Value, key: &str) {
        assert!(
            value.get(key).is_some(),
            "Expected JSON to have key '{key}', got: {value}"
        );
    }

    /// Assert the body of a 429 quota rejection.
    pub fn quota_exceeded(body: &Value) {
        assert_eq!(body["success"], false, "body: {body}");
        assert_eq!(
            body["error"], "Too many requests, please try again later",
            "body: {body}"
        );
        assert!(body["retryAfter"].is_u64(), "body: {body}");
    }

    /// Assert the body of a fail-closed 500.
    pub fn check_failed(body: &Value) {
        assert_eq!(body["success"], false, "body: {body}");
        assert_eq!(body["error"], "Rate limit check failed", "body: {body}");
        assert!(body.get("retryAfter").is_none(), "body: {body}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = get("/api/whoami")
            .forwarded_for("203.0.113.5")
            .identity("fp-1")
            .bearer("k")
            .peer("127.0.0.1:9000")
            .build();

        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.headers()[header::AUTHORIZATION], "Bearer k");
        assert_eq!(request.headers()["x-forwarded-for"], "203.0.113.5");
        assert_eq!(request.headers()[IDENTITY_HEADER], "fp-1");
        assert!(
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .is_some()
        );
    }

    #[test]
    fn test_retry_after() {
        let response = Response::builder()
            .header(header::RETRY_AFTER, "12")
            .body(())
            .unwrap();
        assert_eq!(retry_after(&response), Some(12));

        let response = Response::builder().body(()).unwrap();
        assert_eq!(retry_after(&response), None);
    }

    #[test]
    fn test_assertions() {
        let body = serde_json::json!({
            "success": false,
            "error": "Too many requests, please try again later",
            "retryAfter": 3
        });
        assert::has_key(&body, "retryAfter");
        assert::quota_exceeded(&body);
    }
}
