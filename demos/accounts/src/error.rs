//! Error types for the accounts HTTP API.
//!
//! [`ApiError`] can be converted into an Axum HTTP response via its
//! [`IntoResponse`](axum::response::IntoResponse) implementation. Store
//! failures never expose their internal detail to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ledgerfold::StoreError;

/// Errors returned by the account handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed request: bad body, missing or invalid parameter.
    #[error("{0}")]
    BadRequest(String),

    /// The account does not exist.
    #[error("account not found")]
    NotFound,

    /// The request conflicts with the account's current state.
    #[error("{0}")]
    Unprocessable(String),

    /// Another request modified the account first.
    #[error("account was modified concurrently; retry")]
    Conflict,

    /// Any other failure. Logged, reported to the client generically.
    #[error("internal server error")]
    Internal(#[source] StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(msg) => Self::BadRequest(msg),
            StoreError::Domain(e) => Self::Unprocessable(e.to_string()),
            StoreError::NotFound { .. } => Self::NotFound,
            StoreError::Conflict { .. } => Self::Conflict,
            other => Self::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Internal(source) => {
                tracing::error!(error = %source, "account request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
