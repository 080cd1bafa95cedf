//! Diagnostic route behind the admission pipeline.

use axum::{Extension, Json, Router, routing::get};
use serde::Serialize;

use crate::middleware::{ClientIp, VerifiedIdentity};
use crate::state::AppState;

/// Create the whoami router.
pub fn router() -> Router<AppState> {
    Router::new().route("/api/whoami", get(whoami))
}

/// Rate limit keys resolved for the current request.
#[derive(Debug, Serialize)]
pub struct WhoamiResponse {
    pub ip: Option<String>,
    pub fingerprint: Option<String>,
}

/// Echo the resolved address and identity.
async fn whoami(
    ip: Option<Extension<ClientIp>>,
    identity: Option<Extension<VerifiedIdentity>>,
) -> Json<WhoamiResponse> {
    Json(WhoamiResponse {
        ip: ip.map(|Extension(ClientIp(ip))| ip),
        fingerprint: identity.map(|Extension(VerifiedIdentity(id))| id),
    })
}
