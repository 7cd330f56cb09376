//! Webhook Ingress
//!
//! Turns `{headers, raw body}` from the HTTP layer into an acknowledgement:
//! verify the signature, extract the envelope, drop duplicates, then dispatch
//! to the router. Verification and dedup outcomes never reach handler code.

use std::fmt;
use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use openidconnect::url::form_urlencoded;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::dedup::DeliveryDeduplicator;
use super::events::{EventKind, InboundEvent};
use super::router::{EventRouter, HandlerOutcome};
use super::signing::{self, SignatureScheme, VerifyFailure, DEFAULT_TOLERANCE_SECS};

/// Where an envelope field is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSource {
    /// A request header (case-insensitive).
    Header(String),
    /// An RFC 6901 pointer into a JSON body, e.g. `/event/type`.
    JsonPointer(String),
    /// A field of an `application/x-www-form-urlencoded` body.
    FormField(String),
}

impl FieldSource {
    pub fn header(name: &str) -> Self {
        Self::Header(name.to_ascii_lowercase())
    }

    pub fn pointer(path: impl Into<String>) -> Self {
        Self::JsonPointer(path.into())
    }

    pub fn form(field: impl Into<String>) -> Self {
        Self::FormField(field.into())
    }
}

/// How one provider signs and shapes its deliveries.
#[derive(Clone)]
pub struct ProviderProfile {
    /// Path segment and log label, e.g. `chat`.
    pub name: String,
    pub secret: Zeroizing<String>,
    pub scheme: SignatureScheme,
    pub signature_header: String,
    /// Required when the scheme is timestamped.
    pub timestamp_header: Option<String>,
    pub tolerance_secs: u64,
    /// Each list is tried in order; the first non-empty value wins.
    pub delivery_id: Vec<FieldSource>,
    pub event_type: Vec<FieldSource>,
    pub actor_id: Vec<FieldSource>,
    pub command: Vec<FieldSource>,
}

impl fmt::Debug for ProviderProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderProfile")
            .field("name", &self.name)
            .field("secret", &"[REDACTED]")
            .field("scheme", &self.scheme)
            .field("signature_header", &self.signature_header)
            .field("timestamp_header", &self.timestamp_header)
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl ProviderProfile {
    /// Chat platform: `v0` timestamped signatures, JSON event callbacks and
    /// form-encoded slash commands.
    pub fn chat_platform(secret: impl Into<String>) -> Self {
        Self {
            name: "chat".into(),
            secret: Zeroizing::new(secret.into()),
            scheme: SignatureScheme::versioned("v0"),
            signature_header: "x-signature".into(),
            timestamp_header: Some("x-signature-timestamp".into()),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
            delivery_id: vec![
                FieldSource::header("x-delivery-id"),
                FieldSource::pointer("/event_id"),
                FieldSource::form("trigger_id"),
            ],
            event_type: vec![FieldSource::pointer("/event/type"), FieldSource::pointer("/type")],
            actor_id: vec![
                FieldSource::pointer("/event/user"),
                FieldSource::pointer("/user/id"),
                FieldSource::form("user_id"),
            ],
            command: vec![FieldSource::form("command"), FieldSource::pointer("/command")],
        }
    }

    /// Source-hosting platform: `sha256=` body digests, event type and
    /// delivery id in headers.
    pub fn source_host(secret: impl Into<String>) -> Self {
        Self {
            name: "source".into(),
            secret: Zeroizing::new(secret.into()),
            scheme: SignatureScheme::body_digest("sha256"),
            signature_header: "x-hub-signature-256".into(),
            timestamp_header: None,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
            delivery_id: vec![FieldSource::header("x-delivery-id")],
            event_type: vec![FieldSource::header("x-event-type")],
            actor_id: vec![FieldSource::pointer("/sender/login")],
            command: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tolerance(mut self, tolerance_secs: u64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }
}

/// What happened to a delivery.
#[derive(Debug)]
pub enum Disposition {
    Rejected(VerifyFailure),
    /// Signature was valid but the envelope could not be read.
    Malformed(String),
    Duplicate { delivery_id: String },
    Dispatched {
        delivery_id: String,
        outcomes: Vec<HandlerOutcome>,
    },
}

/// Acknowledgement handed back to the HTTP layer.
#[derive(Debug)]
pub struct IngressResponse {
    pub accept: bool,
    pub status: StatusCode,
    pub disposition: Disposition,
}

impl IngressResponse {
    fn rejected(reason: VerifyFailure) -> Self {
        Self {
            accept: false,
            status: StatusCode::UNAUTHORIZED,
            disposition: Disposition::Rejected(reason),
        }
    }

    fn malformed(reason: impl Into<String>) -> Self {
        Self {
            accept: false,
            status: StatusCode::BAD_REQUEST,
            disposition: Disposition::Malformed(reason.into()),
        }
    }

    /// Handler outcomes, if the delivery was dispatched.
    pub fn outcomes(&self) -> &[HandlerOutcome] {
        match &self.disposition {
            Disposition::Dispatched { outcomes, .. } => outcomes,
            _ => &[],
        }
    }
}

impl IntoResponse for IngressResponse {
    fn into_response(self) -> Response {
        // Rejection reasons stay in the logs, not the response.
        let body = match &self.disposition {
            Disposition::Rejected(_) => serde_json::json!({ "error": "invalid_signature" }),
            Disposition::Malformed(_) => serde_json::json!({ "error": "malformed_event" }),
            Disposition::Duplicate { delivery_id } => serde_json::json!({
                "status": "duplicate",
                "delivery_id": delivery_id,
            }),
            Disposition::Dispatched {
                delivery_id,
                outcomes,
            } => serde_json::json!({
                "status": "dispatched",
                "delivery_id": delivery_id,
                "handlers": outcomes.len(),
                "failed": outcomes.iter().filter(|o| !o.is_success()).count(),
            }),
        };
        (self.status, Json(body)).into_response()
    }
}

/// Parsed forms of a body, computed once per delivery.
struct Body<'a> {
    raw: &'a [u8],
    json: Option<Value>,
}

impl<'a> Body<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self {
            raw,
            json: serde_json::from_slice(raw).ok(),
        }
    }

    fn field(&self, headers: &HeaderMap, sources: &[FieldSource]) -> Option<String> {
        sources
            .iter()
            .find_map(|source| self.lookup(headers, source).filter(|v| !v.is_empty()))
    }

    fn lookup(&self, headers: &HeaderMap, source: &FieldSource) -> Option<String> {
        match source {
            FieldSource::Header(name) => header_str(headers, name).map(str::to_string),
            FieldSource::JsonPointer(path) => match self.json.as_ref()?.pointer(path)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            },
            FieldSource::FormField(field) => {
                if self.json.is_some() {
                    return None;
                }
                form_urlencoded::parse(self.raw)
                    .find(|(key, _)| key == field.as_str())
                    .map(|(_, value)| value.into_owned())
            }
        }
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Hex SHA-256 of the body, used when the provider sends no delivery id.
fn body_digest(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

/// Verify → dedup → dispatch for one provider.
pub struct WebhookIngress {
    profile: ProviderProfile,
    dedup: Arc<DeliveryDeduplicator>,
    router: Arc<EventRouter>,
}

impl WebhookIngress {
    pub const fn new(
        profile: ProviderProfile,
        dedup: Arc<DeliveryDeduplicator>,
        router: Arc<EventRouter>,
    ) -> Self {
        Self {
            profile,
            dedup,
            router,
        }
    }

    pub fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    /// Handle one delivery and return the acknowledgement to send.
    #[tracing::instrument(skip_all, fields(provider = %self.profile.name))]
    pub async fn receive(&self, headers: &HeaderMap, raw_body: Bytes) -> IngressResponse {
        let (signature, signature_timestamp) = match self.verify(headers, &raw_body) {
            Ok(verified) => verified,
            Err(reason) => {
                warn!(reason = %reason, "Rejected webhook delivery");
                return IngressResponse::rejected(reason);
            }
        };

        let event = match self.build_event(headers, raw_body, signature, signature_timestamp) {
            Ok(event) => event,
            Err(reason) => {
                warn!(reason = %reason, "Malformed webhook envelope");
                return IngressResponse::malformed(reason);
            }
        };

        if !self.dedup.observe(&event.delivery_id).first_seen {
            debug!(delivery_id = %event.delivery_id, "Duplicate delivery, acknowledging");
            return IngressResponse {
                accept: true,
                status: StatusCode::OK,
                disposition: Disposition::Duplicate {
                    delivery_id: event.delivery_id,
                },
            };
        }

        info!(
            delivery_id = %event.delivery_id,
            event_type = %event.kind,
            "Dispatching webhook event"
        );
        let delivery_id = event.delivery_id.clone();
        let outcomes = self.router.dispatch(Arc::new(event)).await;

        IngressResponse {
            accept: true,
            status: StatusCode::OK,
            disposition: Disposition::Dispatched {
                delivery_id,
                outcomes,
            },
        }
    }

    fn verify(
        &self,
        headers: &HeaderMap,
        raw_body: &[u8],
    ) -> Result<(String, Option<DateTime<Utc>>), VerifyFailure> {
        let signature = header_str(headers, &self.profile.signature_header)
            .ok_or(VerifyFailure::MissingHeader("signature"))?;
        let secret = self.profile.secret.as_bytes();

        match &self.profile.scheme {
            SignatureScheme::Versioned { version } => {
                let timestamp = self
                    .profile
                    .timestamp_header
                    .as_deref()
                    .and_then(|name| header_str(headers, name))
                    .ok_or(VerifyFailure::MissingHeader("timestamp"))?;
                signing::verify(
                    secret,
                    version,
                    raw_body,
                    signature,
                    timestamp,
                    self.profile.tolerance_secs,
                )
                .into_result()?;
                let at = timestamp
                    .parse::<i64>()
                    .ok()
                    .and_then(|secs| DateTime::from_timestamp(secs, 0));
                Ok((signature.to_string(), at))
            }
            SignatureScheme::BodyDigest { prefix } => {
                signing::verify_body(secret, prefix, raw_body, signature).into_result()?;
                Ok((signature.to_string(), None))
            }
        }
    }

    fn build_event(
        &self,
        headers: &HeaderMap,
        raw_body: Bytes,
        signature: String,
        signature_timestamp: Option<DateTime<Utc>>,
    ) -> Result<InboundEvent, String> {
        let body = Body::new(&raw_body);
        let command = body.field(headers, &self.profile.command);

        let kind = match body.field(headers, &self.profile.event_type) {
            Some(event_type) => EventKind::parse_str(&event_type),
            None if command.is_some() => EventKind::Command,
            None => return Err("event type not found".to_string()),
        };

        let delivery_id = body
            .field(headers, &self.profile.delivery_id)
            .unwrap_or_else(|| body_digest(&raw_body));
        let actor_id = body.field(headers, &self.profile.actor_id);

        Ok(InboundEvent {
            delivery_id,
            kind,
            received_at: Utc::now(),
            raw_body,
            signature,
            signature_timestamp,
            actor_id,
            command,
            provider: self.profile.name.clone(),
        })
    }
}
