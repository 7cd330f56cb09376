//! Token bucket rate limiter.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ratelimit::{RateLimitConfig, RateLimitError, RateLimitHint, MAX_SERVER_PAUSE};

/// Slack for float rounding when comparing token counts.
const TOKEN_EPSILON: f64 = 1e-6;

/// Result of [`RateLimiter::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireResult {
    pub granted: bool,
    /// Suggested wait before trying again. `None` when granted, or when the
    /// cost can never be satisfied.
    pub retry_after: Option<Duration>,
}

impl AcquireResult {
    const fn granted() -> Self {
        Self {
            granted: true,
            retry_after: None,
        }
    }

    const fn denied(retry_after: Option<Duration>) -> Self {
        Self {
            granted: false,
            retry_after,
        }
    }
}

/// Point-in-time view of the bucket.
#[derive(Debug, Clone)]
pub struct RateBudget {
    pub capacity: u32,
    pub tokens_remaining: f64,
    pub refill_rate_per_second: f64,
    pub last_refill_at: Instant,
}

/// Mutable bucket state. A `last_refill` in the future means the bucket is
/// paused until then.
#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Tokens available at `now`, without committing the refill.
    fn level(&self, now: Instant) -> f64 {
        if now <= self.last_refill {
            return self.tokens;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_per_sec).min(self.capacity)
    }

    /// Time until `cost` tokens will be available.
    fn wait_for(&self, cost: f64, now: Instant) -> Option<Duration> {
        if self.refill_per_sec <= 0.0 {
            return None;
        }
        let paused = self.last_refill.saturating_duration_since(now);
        let start = if paused.is_zero() {
            self.level(now)
        } else {
            self.tokens
        };
        let deficit = (cost - start).max(0.0);
        let refill = Duration::try_from_secs_f64(deficit / self.refill_per_sec).unwrap_or(Duration::MAX);
        Some(paused.saturating_add(refill))
    }

    fn commit(&mut self, now: Instant) {
        if now > self.last_refill {
            self.tokens = self.level(now);
            self.last_refill = now;
        }
    }

    /// Suspend refill for `wait`, capped at [`MAX_SERVER_PAUSE`].
    fn pause_for(&mut self, now: Instant, wait: Duration) {
        let until = now
            .checked_add(wait.min(MAX_SERVER_PAUSE))
            .unwrap_or(now);
        self.pause_until(until);
    }

    fn pause_until(&mut self, until: Instant) {
        self.tokens = 0.0;
        if until > self.last_refill {
            self.last_refill = until;
        }
    }
}

/// In-process token bucket guarding one remote credential or endpoint.
///
/// Cheap to clone; clones share the same bucket. All mutation goes through
/// a single mutex.
#[derive(Clone)]
pub struct RateLimiter {
    config: Arc<RateLimitConfig>,
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    /// Creates a limiter starting at full capacity.
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = f64::from(config.limit.requests);
        let bucket = Bucket {
            capacity,
            tokens: capacity,
            refill_per_sec: config.limit.refill_per_sec(),
            last_refill: Instant::now(),
        };
        Self {
            config: Arc::new(config),
            bucket: Arc::new(Mutex::new(bucket)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn capacity(&self) -> u32 {
        self.config.limit.requests
    }

    /// Consume `cost` tokens if available.
    ///
    /// On denial the bucket is left untouched and a suggested wait is
    /// returned.
    pub fn try_acquire(&self, cost: u32) -> AcquireResult {
        if !self.config.enabled {
            return AcquireResult::granted();
        }
        if cost > self.capacity() {
            return AcquireResult::denied(None);
        }

        let cost = f64::from(cost);
        let now = Instant::now();
        let mut bucket = self.lock();

        if now >= bucket.last_refill && bucket.level(now) + TOKEN_EPSILON >= cost {
            bucket.commit(now);
            bucket.tokens = (bucket.tokens - cost).max(0.0);
            return AcquireResult::granted();
        }

        AcquireResult::denied(bucket.wait_for(cost, now))
    }

    /// Wait until `cost` tokens are granted or `cancel` fires.
    pub async fn acquire(&self, cost: u32, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        loop {
            let result = self.try_acquire(cost);
            if result.granted {
                return Ok(());
            }
            let Some(wait) = result.retry_after else {
                return Err(RateLimitError::CostExceedsCapacity {
                    cost,
                    capacity: self.capacity(),
                });
            };
            debug!(cost, wait_ms = wait.as_millis() as u64, "Waiting for rate limit tokens");
            tokio::select! {
                () = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Reconcile with the remote service's own count.
    ///
    /// Tokens are only ever lowered to `remaining`, never raised. When the
    /// service reports zero, refill is suspended until `reset_at`.
    pub fn update_from_server_hint(&self, remaining: u32, reset_at: DateTime<Utc>) {
        if !self.config.enabled {
            return;
        }
        let now = Instant::now();
        let mut bucket = self.lock();
        bucket.commit(now);

        let server = f64::from(remaining);
        if server < bucket.tokens {
            debug!(
                local = bucket.tokens,
                server = remaining,
                "Lowering local token estimate to server count"
            );
            bucket.tokens = server;
        }

        if remaining == 0 {
            let wait = (reset_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(MAX_SERVER_PAUSE);
            bucket.pause_for(now, wait);
            info!(
                reset_in_secs = wait.as_secs(),
                "Remote rate limit exhausted, pausing until reset"
            );
        }
    }

    /// Apply every field of a parsed hint.
    pub fn apply_hint(&self, hint: &RateLimitHint) {
        if let Some(remaining) = hint.remaining {
            let reset_at = hint.reset_at.unwrap_or_else(Utc::now);
            self.update_from_server_hint(remaining, reset_at);
        }
        if let Some(retry_after) = hint.retry_after {
            self.pause_for(retry_after);
        }
    }

    /// Drain the bucket and suspend refill for `duration`, capped at
    /// [`MAX_SERVER_PAUSE`].
    pub fn pause_for(&self, duration: Duration) {
        if !self.config.enabled {
            return;
        }
        let duration = duration.min(MAX_SERVER_PAUSE);
        let now = Instant::now();
        let mut bucket = self.lock();
        bucket.commit(now);
        bucket.pause_for(now, duration);
        warn!(pause_ms = duration.as_millis() as u64, "Rate limiter paused");
    }

    pub fn snapshot(&self) -> RateBudget {
        let now = Instant::now();
        let bucket = self.lock();
        RateBudget {
            capacity: self.capacity(),
            tokens_remaining: bucket.level(now),
            refill_rate_per_second: bucket.refill_per_sec,
            last_refill_at: bucket.last_refill,
        }
    }
}
