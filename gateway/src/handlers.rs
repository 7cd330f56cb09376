//! Built-in Event Handlers
//!
//! The handlers the binary registers out of the box: an audit log of every
//! accepted delivery, a ping responder, and a slash command that answers
//! through the provider's `response_url` via the outbound gateway.

use std::sync::Arc;

use anyhow::Context;
use openidconnect::url::form_urlencoded;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::outbound::{HttpRequest, OutboundGateway, Transport};
use crate::webhooks::{EventHandler, EventKind, EventRouter, HandlerContext, InboundEvent};

/// Slash command answered by [`command_reply`].
pub const RELAY_COMMAND: &str = "/relay";

/// Priority of deferred command replies; users are waiting on these.
const REPLY_PRIORITY: i32 = 10;

#[derive(Debug, Serialize)]
struct CommandReply {
    response_type: &'static str,
    text: String,
}

/// Build the router used by the binary.
pub fn default_router<T>(outbound: OutboundGateway<T>) -> EventRouter
where
    T: Transport<Request = HttpRequest>,
{
    let mut router = EventRouter::new();
    router
        .register(EventKind::Ping, "ping", ping)
        .register_command(RELAY_COMMAND, None, "relay-reply", command_reply(outbound))
        .register_wildcard("audit-log", audit_log);
    router
}

async fn audit_log(event: Arc<InboundEvent>, _ctx: HandlerContext) -> anyhow::Result<()> {
    info!(
        provider = %event.provider,
        delivery_id = %event.delivery_id,
        event_type = %event.kind,
        actor = event.actor_id.as_deref().unwrap_or("-"),
        bytes = event.raw_body.len(),
        "Event accepted"
    );
    Ok(())
}

async fn ping(event: Arc<InboundEvent>, _ctx: HandlerContext) -> anyhow::Result<()> {
    let body = event.json().context("ping body is not JSON")?;
    info!(
        provider = %event.provider,
        hook_id = %body.get("hook_id").unwrap_or(&serde_json::Value::Null),
        "Webhook configured"
    );
    Ok(())
}

fn form_value(raw: &[u8], key: &str) -> Option<String> {
    form_urlencoded::parse(raw)
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Acknowledge the command now and post the real reply to `response_url`
/// from a follow-up task.
pub fn command_reply<T>(outbound: OutboundGateway<T>) -> impl EventHandler
where
    T: Transport<Request = HttpRequest>,
{
    move |event: Arc<InboundEvent>, ctx: HandlerContext| {
        let outbound = outbound.clone();
        async move {
            let response_url = form_value(&event.raw_body, "response_url")
                .context("command has no response_url")?;
            let text = form_value(&event.raw_body, "text").unwrap_or_default();
            let request = HttpRequest::post_json(
                response_url,
                &CommandReply {
                    response_type: "ephemeral",
                    text: format!("Relayed: {text}"),
                },
            )?;

            let delivery_id = ctx.delivery_id().to_string();
            ctx.defer("command-reply", async move {
                match outbound.submit(request, REPLY_PRIORITY).wait().await {
                    Ok(_) => debug!(delivery_id = %delivery_id, "Command reply sent"),
                    Err(e) => warn!(
                        delivery_id = %delivery_id,
                        error = %e,
                        "Command reply failed"
                    ),
                }
            });
            anyhow::Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::{CallError, HttpResponse, OutboundConfig};
    use crate::ratelimit::{RateLimitConfig, RateLimiter};
    use axum::http::StatusCode;
    use bytes::Bytes;
    use chrono::Utc;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, Bytes)>>,
        notify: Notify,
    }

    struct RecordingTransport(Arc<Recorder>);

    impl Transport for RecordingTransport {
        type Request = HttpRequest;
        type Response = HttpResponse;

        fn send<'a>(
            &'a self,
            request: &'a HttpRequest,
        ) -> BoxFuture<'a, Result<HttpResponse, CallError>> {
            async move {
                self.0.sent.lock().unwrap().push((
                    request.url.clone(),
                    request.body.clone().unwrap_or_default(),
                ));
                self.0.notify.notify_one();
                Ok(HttpResponse {
                    status: StatusCode::OK,
                    headers: axum::http::HeaderMap::new(),
                    body: Bytes::new(),
                })
            }
            .boxed()
        }
    }

    fn command_event(body: &'static str) -> Arc<InboundEvent> {
        Arc::new(InboundEvent {
            delivery_id: "trigger-1".into(),
            kind: EventKind::Command,
            received_at: Utc::now(),
            raw_body: Bytes::from_static(body.as_bytes()),
            signature: String::new(),
            signature_timestamp: None,
            actor_id: Some("U1".into()),
            command: Some(RELAY_COMMAND.into()),
            provider: "chat".into(),
        })
    }

    fn gateway(recorder: &Arc<Recorder>) -> OutboundGateway<RecordingTransport> {
        OutboundGateway::new(
            RecordingTransport(Arc::clone(recorder)),
            RateLimiter::new(RateLimitConfig::disabled()),
            OutboundConfig::default(),
        )
    }

    #[tokio::test]
    async fn command_reply_posts_to_response_url() {
        let recorder = Arc::new(Recorder::default());
        let router = default_router(gateway(&recorder));

        let outcomes = router
            .dispatch(command_event(
                "command=%2Frelay&text=hello+there&response_url=http%3A%2F%2Fhooks.test%2Freply",
            ))
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.is_success()));

        tokio::time::timeout(std::time::Duration::from_secs(5), recorder.notify.notified())
            .await
            .unwrap();
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "http://hooks.test/reply");
        let body: serde_json::Value = serde_json::from_slice(&sent[0].1).unwrap();
        assert_eq!(body["text"], "Relayed: hello there");
    }

    #[tokio::test]
    async fn command_without_response_url_fails_only_that_handler() {
        let recorder = Arc::new(Recorder::default());
        let router = default_router(gateway(&recorder));

        let outcomes = router.dispatch(command_event("command=%2Frelay")).await;
        let failed: Vec<_> = outcomes
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| o.handler.as_str())
            .collect();
        assert_eq!(failed, vec!["relay-reply"]);
        assert!(recorder.sent.lock().unwrap().is_empty());
    }
}
