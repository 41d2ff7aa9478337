//! Bearer token introspection.

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::{AppState, ServerError};

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub username: String,
    pub display_name: String,
    pub role: String,
    /// Unix timestamp after which the token is no longer accepted.
    pub expires_at: u64,
}

/// Report who the presented token asserts, or 401.
pub async fn handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Response>, ServerError> {
    let token =
        super::bearer(&headers).ok_or(ServerError::Unauthorized)?;
    let claims = state.token.decode(&token)?;

    Ok(Json(Response {
        username: claims.sub,
        display_name: claims.name,
        role: claims.role,
        expires_at: claims.exp,
    }))
}
