//! Relay Gateway
//!
//! Verified webhook ingress for chat and source-hosting platforms, and
//! rate-aware, retrying delivery of calls back to them.

pub mod api;
pub mod config;
pub mod handlers;
pub mod oauth;
pub mod outbound;
pub mod ratelimit;
pub mod telemetry;
pub mod webhooks;
