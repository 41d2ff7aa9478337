//! Replace an account credential.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use crate::router::{Valid, bearer, source_address};
use crate::{AppState, ServerError};

#[derive(Debug, validator::Validate, Serialize, Deserialize)]
pub struct Body {
    #[validate(length(
        min = 8,
        message = "Password must contain at least 8 characters."
    ))]
    pub new_password: String,
}

pub async fn handler(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Valid(body): Valid<Body>,
) -> Result<StatusCode, ServerError> {
    let token = bearer(&headers);
    let source = source_address(&headers, &peer);

    state
        .gateway
        .reset_credential(
            token.as_deref(),
            &account_id,
            &body.new_password,
            &source,
        )
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::Method;

    use super::*;
    use crate::audit::AuditAction;
    use crate::router::testing;
    use crate::{app, make_request};

    #[tokio::test]
    async fn test_reset_credential() {
        let (state, _, audit) = testing::state();
        let token = testing::bearer(&state);

        let response = make_request(
            Some(&token),
            app(state),
            Method::POST,
            "/users/jsilva/reset",
            r#"{"new_password": "N3w-Secret!"}"#.to_string(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            audit.records()[0].action,
            AuditAction::ResetCredential
        );
    }

    #[tokio::test]
    async fn test_reset_short_password_is_bad_request() {
        let (state, directory, _) = testing::state();
        let token = testing::bearer(&state);

        let response = make_request(
            Some(&token),
            app(state),
            Method::POST,
            "/users/jsilva/reset",
            r#"{"new_password": "short"}"#.to_string(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(directory.mutations(), 0);
    }
}
