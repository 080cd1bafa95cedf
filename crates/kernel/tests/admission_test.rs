//! Out-of-process admission route tests.

mod common;

use std::sync::Arc;

use axum::http::StatusCode;

use common::{FaultyStore, RecordingStore, TestApp, admission};
use tollgate_test_utils::{assert, body_json, get, post, retry_after};

#[tokio::test]
async fn test_admit_reports_remaining() {
    let app = TestApp::new(&[("RATE_LIMIT_IP_MAX", "3")]);

    for expected in [2, 1, 0] {
        let response = app.request(admission("/admission/ip/10.1.1.1").build()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["remaining"], expected);
    }

    let response = app.request(admission("/admission/ip/10.1.1.1").build()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(retry_after(&response).is_some());
    assert::quota_exceeded(&body_json(response).await);
}

#[tokio::test]
async fn test_scopes_are_disjoint() {
    let app = TestApp::new(&[
        ("RATE_LIMIT_IP_MAX", "1"),
        ("RATE_LIMIT_FINGERPRINT_MAX", "1"),
    ]);

    let ip = app.request(admission("/admission/ip/shared-id").build()).await;
    assert_eq!(ip.status(), StatusCode::OK);

    // Same identifier, other scope: a separate record.
    let fingerprint = app
        .request(admission("/admission/fingerprint/shared-id").build())
        .await;
    assert_eq!(fingerprint.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_disabled_scope_has_no_remaining() {
    let app = TestApp::new(&[("RATE_LIMIT_FINGERPRINT_ENABLED", "false")]);

    let response = app
        .request(admission("/admission/fingerprint/fp-1").build())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert!(body["remaining"].is_null());
}

#[tokio::test]
async fn test_unknown_scope_is_not_found() {
    let app = TestApp::new(&[]);

    let response = app.request(admission("/admission/session/abc").build()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_fail_closed_returns_500() {
    let app = TestApp::with_store(
        &[("RATE_LIMIT_FAIL_OPEN", "false")],
        Arc::new(FaultyStore::new("fingerprint:")),
    );

    let response = app
        .request(admission("/admission/fingerprint/fp-2").build())
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert::check_failed(&body_json(response).await);

    // The ip scope is unaffected by the fingerprint fault.
    let response = app.request(admission("/admission/ip/10.1.1.2").build()).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_fail_open_admits_without_remaining() {
    let app = TestApp::with_store(&[], Arc::new(FaultyStore::new("ip:")));

    let response = app.request(admission("/admission/ip/10.1.1.3").build()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await["remaining"].is_null());
}

#[tokio::test]
async fn test_missing_or_wrong_key_is_forbidden() {
    let store = Arc::new(RecordingStore::new());
    let app = TestApp::with_store(&[], store.clone());

    let anonymous = app.request(post("/admission/ip/10.1.1.4").build()).await;
    assert_eq!(anonymous.status(), StatusCode::FORBIDDEN);

    let wrong = app
        .request(post("/admission/ip/10.1.1.4").bearer("guess").build())
        .await;
    assert_eq!(wrong.status(), StatusCode::FORBIDDEN);

    let unknown_scope = app.request(post("/admission/session/abc").build()).await;
    assert_eq!(unknown_scope.status(), StatusCode::FORBIDDEN);

    assert_eq!(store.calls_for("ip:"), 0);
}

#[tokio::test]
async fn test_refused_without_configured_key() {
    let app = TestApp::new(&[("ADMISSION_KEY", "")]);

    let response = app
        .request(admission("/admission/ip/10.1.1.5").build())
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["success"], false);
}

#[tokio::test]
async fn test_anonymous_caller_cannot_drain_identity_quota() {
    let app = TestApp::new(&[("RATE_LIMIT_FINGERPRINT_MAX", "2")]);

    for _ in 0..5 {
        let response = app
            .request(post("/admission/fingerprint/fp-victim").build())
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    // The identity's own traffic still has its full quota.
    for _ in 0..2 {
        let response = app
            .request(
                get("/api/whoami")
                    .forwarded_for("198.51.100.7")
                    .identity("fp-victim")
                    .build(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
