//! Rate limiting error types.

use thiserror::Error;

/// Errors from waiting on the token bucket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// The request can never fit in the bucket.
    #[error("cost {cost} exceeds bucket capacity {capacity}")]
    CostExceedsCapacity { cost: u32, capacity: u32 },
    /// The wait was cancelled before tokens became available.
    #[error("rate limit wait cancelled")]
    Cancelled,
}
