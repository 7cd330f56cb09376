//! API Router and Application State
//!
//! Central routing configuration and shared state.

pub mod oauth;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::oauth::OAuthClient;
use crate::webhooks::WebhookIngress;

/// Largest webhook body accepted (1 MiB).
const MAX_WEBHOOK_BODY: usize = 1024 * 1024;

/// What the installation flow remembers between redirect and callback.
#[derive(Debug, Clone, Default)]
pub struct InstallContext {
    /// Where to send the user once installed.
    pub return_to: Option<String>,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Ingress pipelines keyed by provider name
    pub ingress: Arc<HashMap<String, Arc<WebhookIngress>>>,
    /// Installation flow (optional)
    pub oauth: Option<Arc<OAuthClient<InstallContext>>>,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(
        ingress: impl IntoIterator<Item = WebhookIngress>,
        oauth: Option<OAuthClient<InstallContext>>,
    ) -> Self {
        let ingress = ingress
            .into_iter()
            .map(|i| (i.profile().name.clone(), Arc::new(i)))
            .collect();
        Self {
            ingress: Arc::new(ingress),
            oauth: oauth.map(Arc::new),
        }
    }
}

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    let webhook_routes = Router::new()
        .route("/webhooks/{provider}", post(webhooks::receive))
        .layer(DefaultBodyLimit::max(MAX_WEBHOOK_BODY));

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Inbound deliveries
        .merge(webhook_routes)
        // Installation flow
        .route("/oauth/authorize", get(oauth::authorize))
        .route("/oauth/callback", get(oauth::callback))
        // Middleware
        .layer(TraceLayer::new_for_http())
        // State
        .with_state(state)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    /// Service status
    status: &'static str,
}

/// Health check endpoint.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
