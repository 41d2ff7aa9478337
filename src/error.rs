//! Error handler for dirgate.

use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::audit::AuditError;
use crate::directory::DirectoryError;
use crate::token::TokenError;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Bad credentials. Always generic: the caller must not be able to
    /// distinguish an unknown username from a wrong password.
    #[error("invalid credentials")]
    Auth,

    #[error("missing or invalid 'Authorization' header")]
    Unauthorized,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// The audit record could not be committed. The whole request fails,
    /// even when the directory mutation itself went through.
    #[error("audit record could not be committed")]
    Audit(#[from] AuditError),

    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Axum(#[from] JsonRejection),

    #[error("internal server error, {details}")]
    Internal { details: String },
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(
        self,
    ) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue.to_string(),
            })
        })
        .collect()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = ResponseError::default()
            .title("There were validation errors with your request.")
            .details(&self.to_string())
            .status(StatusCode::BAD_REQUEST);

        let response = match &self {
            ServerError::Validation(validation_errors) => {
                response.errors(validation_errors)
            },

            ServerError::Auth => response
                .title("Invalid credentials.")
                .details("Invalid credentials.")
                .status(StatusCode::UNAUTHORIZED),

            ServerError::Unauthorized | ServerError::Token(_) => response
                .title("Missing or invalid 'Authorization' header.")
                .status(StatusCode::UNAUTHORIZED),

            ServerError::Directory(DirectoryError::NotFound) => response
                .title("Account not found on directory.")
                .status(StatusCode::NOT_FOUND),

            ServerError::Directory(DirectoryError::PermissionDenied) => {
                response
                    .title("Directory refused the operation.")
                    .status(StatusCode::FORBIDDEN)
            },

            ServerError::Directory(DirectoryError::BackendUnavailable) => {
                response
                    .title("Directory backend unavailable.")
                    .status(StatusCode::SERVICE_UNAVAILABLE)
            },

            ServerError::Audit(err) => {
                tracing::error!(error = %err, "audit append failed");

                ResponseError::default()
            },

            ServerError::Internal { details } => {
                tracing::error!(%details, "server returned 500 status");

                ResponseError::default()
            },

            _ => response,
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_errors_map_to_unauthorized() {
        for err in [
            TokenError::Expired,
            TokenError::Malformed,
            TokenError::SignatureInvalid,
        ] {
            let response = ServerError::Token(err).into_response();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn test_directory_errors_statuses() {
        let cases = [
            (DirectoryError::NotFound, StatusCode::NOT_FOUND),
            (DirectoryError::PermissionDenied, StatusCode::FORBIDDEN),
            (
                DirectoryError::BackendUnavailable,
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, status) in cases {
            let response = ServerError::Directory(err).into_response();
            assert_eq!(response.status(), status);
        }
    }
}
