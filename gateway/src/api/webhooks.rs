//! Webhook endpoint.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use tracing::debug;

use super::AppState;

/// `POST /webhooks/{provider}`
///
/// The body is taken as raw bytes; signatures are computed over exactly what
/// the provider sent.
pub async fn receive(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(ingress) = state.ingress.get(&provider) else {
        debug!(provider = %provider, "Delivery for unknown provider");
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown_provider" })),
        )
            .into_response();
    };

    ingress.receive(&headers, body).await.into_response()
}
