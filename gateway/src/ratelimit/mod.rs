//! Outbound rate limiting.
//!
//! An in-process token bucket that predicts a remote service's rate policy
//! and is corrected by the rate-limit headers that service sends back.

pub mod config;
pub mod error;
pub mod hint;
pub mod limiter;

pub use config::*;
pub use error::*;
pub use hint::*;
pub use limiter::*;
