//! Server-supplied rate limit hints.
//!
//! Remote services report their own view of the budget in response headers.
//! The limiter treats these as ground truth whenever they are lower than its
//! local estimate.

use std::time::Duration;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};

pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Longest pause a remote service can impose through its headers.
pub const MAX_SERVER_PAUSE: Duration = Duration::from_secs(6 * 60 * 60);

/// Rate limit state reported by the remote service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHint {
    /// Requests left in the current window.
    pub remaining: Option<u32>,
    /// When the window resets.
    pub reset_at: Option<DateTime<Utc>>,
    /// Explicit wait requested by the service.
    pub retry_after: Option<Duration>,
}

impl RateLimitHint {
    /// Read `x-ratelimit-remaining`, `x-ratelimit-reset` (unix seconds) and
    /// `retry-after` (seconds, capped at [`MAX_SERVER_PAUSE`]). Returns `None`
    /// when none are present.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        let hint = Self {
            remaining: get(REMAINING_HEADER).and_then(|v| v.trim().parse().ok()),
            reset_at: get(RESET_HEADER)
                .and_then(|v| v.trim().parse::<i64>().ok())
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            retry_after: get(RETRY_AFTER_HEADER)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| Duration::from_secs(secs).min(MAX_SERVER_PAUSE)),
        };

        (!hint.is_empty()).then_some(hint)
    }

    pub const fn is_empty(&self) -> bool {
        self.remaining.is_none() && self.reset_at.is_none() && self.retry_after.is_none()
    }

    /// Whether the service reports the budget as spent.
    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn parses_all_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(REMAINING_HEADER, HeaderValue::from_static("0"));
        headers.insert(RESET_HEADER, HeaderValue::from_static("1700000000"));
        headers.insert(RETRY_AFTER_HEADER, HeaderValue::from_static("30"));

        let hint = RateLimitHint::from_headers(&headers).unwrap();
        assert_eq!(hint.remaining, Some(0));
        assert_eq!(hint.reset_at.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(hint.retry_after, Some(Duration::from_secs(30)));
        assert!(hint.is_exhausted());
    }

    #[test]
    fn oversized_retry_after_is_capped() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER_HEADER, HeaderValue::from_static("18446744073709551615"));
        let hint = RateLimitHint::from_headers(&headers).unwrap();
        assert_eq!(hint.retry_after, Some(MAX_SERVER_PAUSE));
    }

    #[test]
    fn absent_or_garbage_headers_yield_none() {
        assert!(RateLimitHint::from_headers(&HeaderMap::new()).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(REMAINING_HEADER, HeaderValue::from_static("lots"));
        headers.insert(RETRY_AFTER_HEADER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert!(RateLimitHint::from_headers(&headers).is_none());
    }
}
