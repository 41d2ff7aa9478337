//! Directory-account HTTP API.

mod disable;
mod enable;
mod reset;
mod search;

use axum::Router;
use axum::routing::{get, post};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        // `GET /users/search?query=` goes to `search`.
        .route("/search", get(search::handler))
        // `POST /users/:ID/disable` goes to `disable`.
        .route("/{account_id}/disable", post(disable::handler))
        // `POST /users/:ID/enable` goes to `enable`.
        .route("/{account_id}/enable", post(enable::handler))
        // `POST /users/:ID/reset` goes to `reset`. Body carries the new
        // password.
        .route("/{account_id}/reset", post(reset::handler))
}
