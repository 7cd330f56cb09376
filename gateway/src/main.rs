//! Relay Gateway - Main Entry Point
//!
//! Receives webhooks, dispatches them to handlers and delivers their replies.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_gateway::{
    api, config, handlers,
    oauth::OAuthClient,
    outbound::{HttpTransport, OutboundGateway},
    ratelimit::RateLimiter,
    telemetry,
    webhooks::{DeliveryDeduplicator, WebhookIngress},
};

/// How often expired delivery ids are swept.
const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    telemetry::init_tracing();
    let config = config::Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Relay Gateway"
    );

    // Outbound path: one limiter, queue and drain task for the provider API
    if !config.rate_limit.enabled {
        info!("Outbound rate limiting disabled by configuration");
    }
    let limiter = RateLimiter::new(config.rate_limit.clone());
    let transport = HttpTransport::new(config.outbound.retry.attempt_timeout)?;
    let outbound = OutboundGateway::new(transport, limiter, config.outbound.clone());

    // Inbound path
    let background = CancellationToken::new();
    let dedup = Arc::new(DeliveryDeduplicator::new(config.dedup.clone()));
    let sweeper = dedup.spawn_sweeper(DEDUP_SWEEP_INTERVAL, background.clone());
    let router = Arc::new(handlers::default_router(outbound.clone()));

    let ingress: Vec<_> = config
        .provider_profiles()
        .into_iter()
        .map(|profile| {
            info!(provider = %profile.name, "Webhook provider enabled");
            WebhookIngress::new(profile, Arc::clone(&dedup), Arc::clone(&router))
        })
        .collect();

    // Installation flow (optional)
    let oauth = match config.oauth.clone() {
        Some(oauth_config) => {
            let client = OAuthClient::new(oauth_config)?;
            info!("OAuth installation flow enabled");
            Some(client)
        }
        None => {
            info!("OAuth not configured, installation flow disabled");
            None
        }
    };

    // Build router
    let app = api::create_router(api::AppState::new(ingress, oauth));

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "Server listening");

    // Graceful shutdown handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    router.shutdown();
    outbound.shutdown().await;
    background.cancel();
    if let Err(e) = sweeper.await {
        warn!("Dedup sweeper ended abnormally: {}", e);
    }

    info!("Server shutdown complete");

    Ok(())
}
