//! Outbound Calls
//!
//! Rate-aware scheduling, queuing and retrying of requests to remote
//! services.

pub mod client;
pub mod error;
pub mod queue;
pub mod retry;
pub mod transport;

pub use client::{CallHandle, OutboundConfig, OutboundGateway};
pub use error::{CallError, OutboundError};
pub use queue::{QueuedCall, RequestQueue};
pub use retry::{RetryExecutor, RetryPlan, RetryPolicy};
pub use transport::{classify_status, HttpRequest, HttpResponse, HttpTransport, Transport};
