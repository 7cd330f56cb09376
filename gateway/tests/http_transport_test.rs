//! HTTP Transport Tests
//!
//! Runs the reqwest-backed transport through the gateway against a real
//! local server that misbehaves on purpose.

mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use helpers::spawn_test_server;

use relay_gateway::outbound::{
    CallError, HttpRequest, HttpTransport, OutboundConfig, OutboundError, OutboundGateway,
    RetryPolicy,
};
use relay_gateway::ratelimit::{RateLimitConfig, RateLimiter};

#[derive(Clone, Default)]
struct Counters {
    flaky: Arc<AtomicUsize>,
    limited: Arc<AtomicUsize>,
    denied: Arc<AtomicUsize>,
}

async fn flaky(State(c): State<Counters>) -> impl IntoResponse {
    if c.flaky.fetch_add(1, Ordering::SeqCst) < 2 {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    } else {
        (
            [("x-ratelimit-remaining", "42")],
            Json(serde_json::json!({ "ok": true })),
        )
            .into_response()
    }
}

async fn limited(State(c): State<Counters>) -> impl IntoResponse {
    if c.limited.fetch_add(1, Ordering::SeqCst) == 0 {
        (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "1")]).into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

async fn denied(State(c): State<Counters>, headers: HeaderMap) -> StatusCode {
    c.denied.fetch_add(1, Ordering::SeqCst);
    if headers.contains_key("authorization") {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::UNAUTHORIZED
    }
}

async fn echo(Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
    Json(body)
}

async fn remote() -> (helpers::TestServer, Counters) {
    let counters = Counters::default();
    let router = Router::new()
        .route("/flaky", get(flaky))
        .route("/limited", get(limited))
        .route("/denied", get(denied))
        .route("/echo", post(echo))
        .with_state(counters.clone());
    (spawn_test_server(router).await, counters)
}

fn gateway() -> OutboundGateway<HttpTransport> {
    let transport = HttpTransport::new(Some(Duration::from_secs(5))).expect("client builds");
    OutboundGateway::new(
        transport,
        RateLimiter::new(RateLimitConfig::default()),
        OutboundConfig {
            queue_size: 10,
            max_in_flight: 2,
            retry: RetryPolicy {
                max_attempts: 4,
                base_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(200),
                multiplier: 2.0,
                jitter: 0.0,
                attempt_timeout: Some(Duration::from_secs(5)),
            },
        },
    )
}

#[tokio::test]
async fn server_errors_are_retried_and_hints_applied() {
    let (server, counters) = remote().await;
    let gateway = gateway();

    let response = gateway
        .submit(HttpRequest::get(format!("{}/flaky", server.url)), 0)
        .wait()
        .await
        .expect("third attempt succeeds");

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json::<serde_json::Value>().unwrap()["ok"], true);
    assert_eq!(counters.flaky.load(Ordering::SeqCst), 3);
    // The success carried `remaining: 42`, lowering the local budget.
    assert!(gateway.limiter().snapshot().tokens_remaining <= 42.5);
}

#[tokio::test]
async fn too_many_requests_waits_for_retry_after() {
    let (server, counters) = remote().await;
    let gateway = gateway();

    let start = std::time::Instant::now();
    let response = gateway
        .submit(HttpRequest::get(format!("{}/limited", server.url)), 0)
        .wait()
        .await
        .expect("second attempt succeeds");

    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert_eq!(counters.limited.load(Ordering::SeqCst), 2);
    assert!(start.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn auth_failures_are_not_retried() {
    let (server, counters) = remote().await;
    let gateway = gateway();

    let result = gateway
        .submit(
            HttpRequest::get(format!("{}/denied", server.url)).with_bearer("expired"),
            0,
        )
        .wait()
        .await;

    assert!(matches!(
        result,
        Err(OutboundError::Fatal(CallError::Fatal(ref msg))) if msg.contains("403")
    ));
    assert_eq!(counters.denied.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn json_bodies_round_trip() {
    let (server, _) = remote().await;
    let gateway = gateway();

    let request = HttpRequest::post_json(
        format!("{}/echo", server.url),
        &serde_json::json!({ "text": "deployed" }),
    )
    .unwrap();
    let response = gateway.submit(request, 0).wait().await.unwrap();
    assert_eq!(
        response.json::<serde_json::Value>().unwrap(),
        serde_json::json!({ "text": "deployed" })
    );
}

#[tokio::test]
async fn unreachable_host_exhausts_retries() {
    // Bind then drop a listener so the port is almost certainly closed.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let gateway = gateway();

    let result = gateway
        .submit(HttpRequest::get(format!("http://{addr}/gone")), 0)
        .wait()
        .await;

    assert!(matches!(
        result,
        Err(OutboundError::RetryExhausted { attempts: 4, last: CallError::Transient(_) })
    ));
}
