//! HTTP surface of the gateway.

pub mod audit;
pub mod login;
pub mod status;
pub mod users;
pub mod verify;

use std::net::SocketAddr;

use axum::Json;
use axum::extract::{FromRequest, Request};
use axum::http::{HeaderMap, header};
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::ServerError;

const BEARER: &str = "Bearer ";

/// JSON body extractor running `validator` rules before the handler sees
/// the payload.
pub struct Valid<T>(pub T);

impl<S, T> FromRequest<S> for Valid<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate,
{
    type Rejection = ServerError;

    async fn from_request(
        req: Request,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let Json(body) = Json::<T>::from_request(req, state).await?;
        body.validate()?;
        Ok(Valid(body))
    }
}

/// Bearer token from the `Authorization` header, scheme stripped.
pub(crate) fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .map(|token| token.trim_start_matches(BEARER).to_owned())
}

/// Client address for the audit trail. Proxy header first, then the peer
/// address of the connection itself for direct callers.
pub(crate) fn source_address(
    headers: &HeaderMap,
    peer: &SocketAddr,
) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|header| header.to_str().ok())
        .and_then(|forwarded| forwarded.split(',').next())
        .map(|address| address.trim().to_owned())
        .filter(|address| !address.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}
