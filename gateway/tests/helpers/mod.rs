//! Reusable test helpers for HTTP integration tests.
//!
//! Provides `TestApp` for sending requests through the full axum router with
//! counting handlers attached, signing helpers for both provider schemes,
//! and `spawn_test_server` for tests that need a real listener (token
//! endpoints, remote APIs).
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{self, Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use relay_gateway::api::{create_router, AppState, InstallContext};
use relay_gateway::config::Config;
use relay_gateway::oauth::OAuthClient;
use relay_gateway::webhooks::signing::{sign_body, sign_versioned};
use relay_gateway::webhooks::{
    DeliveryDeduplicator, EventKind, EventRouter, HandlerContext, InboundEvent, WebhookIngress,
};

pub const CHAT_SECRET: &str = "test-chat-secret";
pub const SOURCE_SECRET: &str = "test-source-secret";

/// Router plus counters for what the handlers saw.
pub struct TestApp {
    pub router: Router,
    pub config: Config,
    /// Invocations of the `app_mention` handler.
    pub mentions: Arc<AtomicUsize>,
    /// Invocations of the `push` handler.
    pub pushes: Arc<AtomicUsize>,
}

fn counting_router(mentions: &Arc<AtomicUsize>, pushes: &Arc<AtomicUsize>) -> EventRouter {
    let mut router = EventRouter::new();
    let m = Arc::clone(mentions);
    router.register(EventKind::Mention, "count-mentions", move |_: Arc<InboundEvent>, _: HandlerContext| {
        m.fetch_add(1, Ordering::SeqCst);
        async { anyhow::Ok(()) }
    });
    let p = Arc::clone(pushes);
    router.register(EventKind::Push, "count-pushes", move |_: Arc<InboundEvent>, _: HandlerContext| {
        p.fetch_add(1, Ordering::SeqCst);
        async { anyhow::Ok(()) }
    });
    router
}

impl TestApp {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_oauth(client: OAuthClient<InstallContext>) -> Self {
        Self::build(Some(client))
    }

    fn build(oauth: Option<OAuthClient<InstallContext>>) -> Self {
        let config = Config::default_for_test();
        let mentions = Arc::new(AtomicUsize::new(0));
        let pushes = Arc::new(AtomicUsize::new(0));

        let dedup = Arc::new(DeliveryDeduplicator::new(config.dedup.clone()));
        let events = Arc::new(counting_router(&mentions, &pushes));
        let ingress: Vec<_> = config
            .provider_profiles()
            .into_iter()
            .map(|profile| WebhookIngress::new(profile, Arc::clone(&dedup), Arc::clone(&events)))
            .collect();

        Self {
            router: create_router(AppState::new(ingress, oauth)),
            config,
            mentions,
            pushes,
        }
    }

    pub fn request(method: Method, uri: &str) -> http::request::Builder {
        Request::builder().method(method).uri(uri)
    }

    pub async fn oneshot(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("Router is infallible")
    }
}

/// A chat-platform delivery signed with [`CHAT_SECRET`] at the current time.
pub fn signed_chat_request(body: &str) -> Request<Body> {
    let ts = chrono::Utc::now().timestamp();
    let signature = sign_versioned(CHAT_SECRET.as_bytes(), "v0", ts, body.as_bytes());
    Request::builder()
        .method(Method::POST)
        .uri("/webhooks/chat")
        .header("content-type", "application/json")
        .header("x-signature", signature)
        .header("x-signature-timestamp", ts.to_string())
        .body(Body::from(body.to_string()))
        .expect("valid request")
}

/// A source-host delivery signed with [`SOURCE_SECRET`].
pub fn signed_source_request(event: &str, delivery_id: &str, body: &str) -> Request<Body> {
    let signature = sign_body(SOURCE_SECRET.as_bytes(), "sha256", body.as_bytes());
    Request::builder()
        .method(Method::POST)
        .uri("/webhooks/source")
        .header("content-type", "application/json")
        .header("x-hub-signature-256", signature)
        .header("x-event-type", event)
        .header("x-delivery-id", delivery_id)
        .body(Body::from(body.to_string()))
        .expect("valid request")
}

/// A running test server bound to a random port.
pub struct TestServer {
    /// Server address (127.0.0.1:PORT).
    pub addr: SocketAddr,
    /// Base URL for HTTP requests (e.g., `http://127.0.0.1:12345`).
    pub url: String,
    /// Handle to the server task for cleanup.
    _handle: JoinHandle<()>,
}

/// Spawn a real HTTP server on a random port.
pub async fn spawn_test_server(router: Router) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("Failed to get local addr");
    let url = format!("http://{addr}");

    let handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("Test server failed");
    });

    TestServer {
        addr,
        url,
        _handle: handle,
    }
}

pub async fn body_to_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to collect response body")
        .to_bytes();
    serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        let preview = String::from_utf8_lossy(&bytes);
        panic!("Failed to parse response as JSON: {e}\nBody: {preview}")
    })
}
