//! OAuth error types.

use std::time::Duration;

use axum::http::header::HeaderValue;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// OAuth handshake errors.
#[derive(Debug, Error)]
pub enum OAuthError {
    /// Unknown, expired or already-used state. Deliberately uninformative.
    #[error("invalid state")]
    StateInvalid,
    #[error("too many pending authorization requests")]
    TooManyPendingStates,
    /// The provider rejected the code exchange.
    #[error("code exchange failed: {0}")]
    Exchange(String),
    #[error("OAuth misconfigured: {0}")]
    Configuration(String),
    #[error("token endpoint request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl OAuthError {
    /// How long clients should wait when the pending-state table is full.
    pub const PENDING_RETRY_AFTER: Duration = Duration::from_secs(30);
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::StateInvalid => (StatusCode::BAD_REQUEST, "invalid_state"),
            Self::TooManyPendingStates => (StatusCode::SERVICE_UNAVAILABLE, "too_many_pending"),
            Self::Exchange(_) => (StatusCode::BAD_GATEWAY, "exchange_failed"),
            Self::Configuration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "misconfigured"),
            Self::Http(_) => (StatusCode::BAD_GATEWAY, "provider_unreachable"),
        };
        let mut response =
            (status, Json(serde_json::json!({ "error": code }))).into_response();
        if matches!(self, Self::TooManyPendingStates) {
            let secs = Self::PENDING_RETRY_AFTER.as_secs().to_string();
            if let Ok(v) = HeaderValue::from_str(&secs) {
                response.headers_mut().insert("Retry-After", v);
            }
        }
        response
    }
}
