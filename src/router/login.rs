//! Administrator login.

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::router::Valid;
use crate::{AppState, ServerError};

#[derive(Debug, validator::Validate, Serialize, Deserialize)]
pub struct Body {
    #[validate(length(
        min = 1,
        max = 64,
        message = "Username must be 1 to 64 characters long."
    ))]
    pub username: String,
    #[validate(length(min = 1, message = "Password must not be empty."))]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub token: String,
    pub display_name: String,
    pub role: String,
    /// Seconds until the token expires.
    pub expires_in: u64,
}

pub async fn handler(
    State(state): State<AppState>,
    Valid(body): Valid<Body>,
) -> Result<Json<Response>, ServerError> {
    let identity =
        state.credentials.verify(&body.username, &body.password)?;
    let token = state.token.create(identity)?;

    tracing::info!(username = %identity.username, "administrator logged in");

    Ok(Json(Response {
        token,
        display_name: identity.display_name.clone(),
        role: identity.role.clone(),
        expires_in: state.token.ttl(),
    }))
}
