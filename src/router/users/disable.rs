//! Disable an account.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};

use crate::router::{bearer, source_address};
use crate::{AppState, ServerError};

/// Acknowledged only after the mutation and its audit record both landed.
pub async fn handler(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<StatusCode, ServerError> {
    let token = bearer(&headers);
    let source = source_address(&headers, &peer);

    state
        .gateway
        .disable_account(token.as_deref(), &account_id, &source)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::Method;
    use http_body_util::BodyExt;

    use super::*;
    use crate::audit::{AuditAction, AuditOutcome};
    use crate::router::testing;
    use crate::{app, make_request};

    #[tokio::test]
    async fn test_disable_account() {
        let (state, directory, audit) = testing::state();
        let token = testing::bearer(&state);

        let response = make_request(
            Some(&token),
            app(state),
            Method::POST,
            "/users/jsilva/disable",
            String::default(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!directory.get("jsilva").unwrap().enabled);

        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, AuditAction::Disable);
        assert_eq!(records[0].outcome, AuditOutcome::Success);
        // No proxy header on the request: the peer address is recorded.
        assert_eq!(records[0].source_address, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_disable_without_token() {
        let (state, directory, audit) = testing::state();

        let response = make_request(
            None,
            app(state),
            Method::POST,
            "/users/jsilva/disable",
            String::default(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(directory.get("jsilva").unwrap().enabled);
        assert_eq!(audit.records().len(), 1);
    }

    #[tokio::test]
    async fn test_disable_unknown_account() {
        let (state, _, _) = testing::state();
        let token = testing::bearer(&state);

        let response = make_request(
            Some(&token),
            app(state),
            Method::POST,
            "/users/ghost/disable",
            String::default(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], 404);
        assert_eq!(body["title"], "Account not found on directory.");
    }
}
