//! Out-of-process admission checks.
//!
//! Lets a collaborator that does not run this pipeline in-process ask for a
//! verdict on an arbitrary identifier, e.g. a gateway keyed on API tokens.
//! Every call spends quota, so callers must present `ADMISSION_KEY` as a
//! bearer token.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Serialize;
use tracing::info;

use super::require_secret;
use crate::error::{AppError, AppResult};
use crate::limiter::{Admission, Scope};
use crate::state::AppState;

/// Create the admission router.
pub fn router() -> Router<AppState> {
    Router::new().route("/admission/{scope}/{identifier}", post(check_admission))
}

/// Admission granted.
#[derive(Debug, Serialize)]
pub struct AdmissionResponse {
    pub success: bool,
    /// Slots left in the current window; `null` when the scope is disabled
    /// or the check failed open.
    pub remaining: Option<u64>,
}

/// The token of an `Authorization: Bearer` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Run one admission check for `identifier` in `scope`.
async fn check_admission(
    State(state): State<AppState>,
    Path((scope, identifier)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Response> {
    require_secret(bearer_token(&headers), state.config().admission_key.as_deref())
        .inspect_err(|_| info!("admission call refused"))?;

    let scope: Scope = scope.parse().map_err(|_| AppError::NotFound)?;
    if identifier.trim().is_empty() {
        return Err(AppError::BadRequest("identifier must not be empty".into()));
    }

    let response = match state.limiter(scope).check(&identifier).await {
        Admission::Proceed { remaining } => Json(AdmissionResponse {
            success: true,
            remaining,
        })
        .into_response(),
        Admission::Rejected(rejection) => rejection.into_response(),
    };
    Ok(response)
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
    }
}
