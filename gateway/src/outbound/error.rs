//! Outbound call error types.

use std::time::Duration;

use axum::http::header::HeaderValue;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Classified failure of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The remote service throttled the call.
    #[error("rate limited by remote service")]
    RateLimited { retry_after: Option<Duration> },
    /// Network or server-side error that may succeed on retry.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The attempt exceeded its deadline.
    #[error("attempt timed out")]
    Timeout,
    /// Authentication, validation or not-found; retrying will not help.
    #[error("fatal failure: {0}")]
    Fatal(String),
    /// The attempt was abandoned before it was sent.
    #[error("attempt cancelled")]
    Cancelled,
}

impl CallError {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_) | Self::Timeout)
    }

    /// Server-requested wait, if any.
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Terminal outcome of a submitted call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutboundError {
    /// The request queue is at capacity.
    #[error("outbound queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: CallError },
    /// A non-retryable failure.
    #[error(transparent)]
    Fatal(CallError),
    /// The caller cancelled the call before it ran.
    #[error("call cancelled")]
    Cancelled,
    /// The gateway shut down before the call ran.
    #[error("gateway is shutting down")]
    ShuttingDown,
    /// The call costs more tokens than the bucket can ever hold.
    #[error("call cost {cost} exceeds rate limit capacity {capacity}")]
    CostExceedsCapacity { cost: u32, capacity: u32 },
}

/// JSON response body for outbound errors.
#[derive(Serialize)]
pub struct OutboundErrorResponse {
    /// Error code identifier.
    pub error: &'static str,
    /// Human-readable error message.
    pub message: String,
}

impl OutboundError {
    /// Error code identifier used in responses and logs.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Fatal(_) => "upstream_rejected",
            Self::Cancelled => "cancelled",
            Self::ShuttingDown => "shutting_down",
            Self::CostExceedsCapacity { .. } => "cost_exceeds_capacity",
        }
    }
}

impl IntoResponse for OutboundError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::QueueFull { .. } | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::RetryExhausted { .. } | Self::Fatal(_) => StatusCode::BAD_GATEWAY,
            Self::Cancelled => StatusCode::CONFLICT,
            Self::CostExceedsCapacity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        };
        let retry_after = match &self {
            Self::RetryExhausted { last, .. } => last.retry_after(),
            Self::QueueFull { .. } => Some(Duration::from_secs(1)),
            _ => None,
        };

        let body = OutboundErrorResponse {
            error: self.code(),
            message: self.to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(wait) = retry_after {
            let secs = wait.as_secs().max(1);
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("Retry-After", v);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(CallError::RateLimited { retry_after: None }.is_retryable());
        assert!(CallError::Transient("reset".into()).is_retryable());
        assert!(CallError::Timeout.is_retryable());
        assert!(!CallError::Fatal("401".into()).is_retryable());
        assert!(!CallError::Cancelled.is_retryable());
        assert_eq!(
            CallError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
            .retry_after(),
            Some(Duration::from_secs(7))
        );
        assert_eq!(CallError::Timeout.retry_after(), None);
    }

    #[test]
    fn queue_full_response_has_retry_after() {
        let response = OutboundError::QueueFull { capacity: 10 }.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "1");
    }

    #[test]
    fn exhausted_rate_limit_carries_server_wait() {
        let err = OutboundError::RetryExhausted {
            attempts: 3,
            last: CallError::RateLimited {
                retry_after: Some(Duration::from_secs(42)),
            },
        };
        assert_eq!(err.code(), "retry_exhausted");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "42");
    }
}
