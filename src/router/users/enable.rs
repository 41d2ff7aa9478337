//! Re-enable an account.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};

use crate::router::{bearer, source_address};
use crate::{AppState, ServerError};

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
        .enable_account(token.as_deref(), &account_id, &source)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}
