//! Inbound Webhooks
//!
//! Signature verification, delivery deduplication and event routing for
//! deliveries pushed by external producers.

pub mod dedup;
pub mod events;
pub mod followup;
pub mod ingress;
pub mod router;
pub mod signing;

pub use dedup::{DedupConfig, DeliveryDeduplicator, Observation};
pub use events::{EventKind, InboundEvent};
pub use followup::{FollowUp, FollowUpError, HandlerContext};
pub use ingress::{Disposition, FieldSource, IngressResponse, ProviderProfile, WebhookIngress};
pub use router::{EventHandler, EventRouter, HandlerError, HandlerOutcome, Route};
pub use signing::{SignatureScheme, Verification, VerifyFailure};
