//! Account lookup.

use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;

use crate::directory::DirectoryUser;
use crate::router::{bearer, source_address};
use crate::{AppState, ServerError};

#[derive(Debug, Deserialize)]
pub struct Params {
    query: String,
}

pub async fn handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Result<Json<DirectoryUser>, ServerError> {
    let token = bearer(&headers);
    let source = source_address(&headers, &peer);

    let user = state
        .gateway
        .search_account(token.as_deref(), &params.query, &source)
        .await?;

    Ok(Json(user))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use http_body_util::BodyExt;

    use super::*;
    use crate::audit::{AuditAction, AuditOutcome};
    use crate::router::testing;
    use crate::{app, make_request};

    #[tokio::test]
    async fn test_search_by_fuzzy_name() {
        let (state, _, _) = testing::state();
        let token = testing::bearer(&state);

        let response = make_request(
            Some(&token),
            app(state),
            Method::GET,
            "/users/search?query=Maria",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let user: DirectoryUser = serde_json::from_slice(&body).unwrap();
        assert_eq!(user.account_id, "mcosta");
    }

    #[tokio::test]
    async fn test_search_unknown_account_is_not_found() {
        let (state, _, audit) = testing::state();
        let token = testing::bearer(&state);

        let response = make_request(
            Some(&token),
            app(state),
            Method::GET,
            "/users/search?query=ghost",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // The failed lookup is on the trail too.
        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, AuditAction::Search);
        assert!(matches!(
            records[0].outcome,
            AuditOutcome::Failure { .. }
        ));
    }

    #[tokio::test]
    async fn test_search_without_token_is_audited_unauthorized() {
        let (state, _, audit) = testing::state();

        let response = make_request(
            None,
            app(state),
            Method::GET,
            "/users/search?query=jsilva",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].actor, "unknown");
    }

    #[tokio::test]
    async fn test_search_when_backend_unavailable() {
        let (state, _, _) = testing::state_with(
            crate::directory::fake::FakeDirectory::seeded_unavailable(),
        );
        let token = testing::bearer(&state);

        let response = make_request(
            Some(&token),
            app(state),
            Method::GET,
            "/users/search?query=jsilva",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
