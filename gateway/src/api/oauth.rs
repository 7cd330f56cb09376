//! Installation flow endpoints.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{AppState, InstallContext};
use crate::oauth::OAuthError;

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    pub return_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set by the provider when the user declined.
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InstallResponse {
    pub installed: bool,
    pub token_type: String,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_to: Option<String>,
}

fn oauth_disabled() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "oauth_disabled" })),
    )
        .into_response()
}

/// `GET /oauth/authorize` - redirect to the provider.
pub async fn authorize(
    State(state): State<AppState>,
    Query(query): Query<AuthorizeQuery>,
) -> Response {
    let Some(client) = state.oauth.as_ref() else {
        return oauth_disabled();
    };

    match client.authorization_url(InstallContext {
        return_to: query.return_to,
    }) {
        Ok(request) => Redirect::to(&request.url).into_response(),
        Err(e) => e.into_response(),
    }
}

/// `GET /oauth/callback` - finish the handshake.
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(client) = state.oauth.as_ref() else {
        return oauth_disabled();
    };

    if let Some(error) = query.error {
        // Burn the state so it cannot be replayed with a forged code.
        if let Some(token) = &query.state {
            let _ = client.states().validate_and_consume(token);
        }
        warn!(error = %error, "Provider reported authorization failure");
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "access_denied" })),
        )
            .into_response();
    }

    let (Some(code), Some(token)) = (query.code, query.state) else {
        return OAuthError::StateInvalid.into_response();
    };

    match client.complete(&code, &token).await {
        Ok((credentials, context)) => {
            info!(token_type = %credentials.token_type, "Installation completed");
            Json(InstallResponse {
                installed: true,
                token_type: credentials.token_type.clone(),
                scopes: credentials.scopes.clone(),
                return_to: context.return_to,
            })
            .into_response()
        }
        Err(e) => e.into_response(),
    }
}
