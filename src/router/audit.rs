//! Audit trail listing.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;

use crate::audit::AuditRecord;
use crate::{AppState, ServerError};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct Params {
    limit: Option<usize>,
}

/// Most recent audit records first. Reading the trail needs a valid token
/// but is not itself recorded.
pub async fn handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Result<Json<Vec<AuditRecord>>, ServerError> {
    let token =
        super::bearer(&headers).ok_or(ServerError::Unauthorized)?;
    state.token.decode(&token)?;

    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    Ok(Json(state.gateway.audit_trail(limit).await?))
}
