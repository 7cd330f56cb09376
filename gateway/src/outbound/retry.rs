//! Retry Executor
//!
//! Runs one outbound call with failure classification, exponential backoff
//! with jitter, and an attempt ceiling. Fatal failures surface immediately;
//! a server-supplied `retry_after` replaces the computed backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::error::{CallError, OutboundError};

/// How a call is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the backoff added as random jitter.
    pub jitter: f64,
    /// Deadline for each attempt; exceeding it is a retryable failure.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            attempt_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy from environment variables.
    ///
    /// - `RETRY_MAX_ATTEMPTS` (default: 5)
    /// - `RETRY_BASE_DELAY_MS` (default: 500)
    /// - `RETRY_MAX_DELAY_MS` (default: 30000)
    /// - `RETRY_MULTIPLIER` (default: 2.0)
    /// - `RETRY_JITTER` (default: 0.2)
    /// - `RETRY_ATTEMPT_TIMEOUT_SECS` (default: 10, 0 disables)
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
        }

        let mut policy = Self::default();
        if let Some(n) = var::<u32>("RETRY_MAX_ATTEMPTS").filter(|n| *n > 0) {
            policy.max_attempts = n;
        }
        if let Some(ms) = var("RETRY_BASE_DELAY_MS") {
            policy.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = var("RETRY_MAX_DELAY_MS") {
            policy.max_delay = Duration::from_millis(ms);
        }
        if let Some(m) = var::<f64>("RETRY_MULTIPLIER").filter(|m| m.is_finite() && *m >= 1.0) {
            policy.multiplier = m;
        }
        if let Some(j) = var::<f64>("RETRY_JITTER").filter(|j| (0.0..=1.0).contains(j)) {
            policy.jitter = j;
        }
        if let Some(secs) = var::<u64>("RETRY_ATTEMPT_TIMEOUT_SECS") {
            policy.attempt_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        policy
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn plan(&self) -> RetryPlan {
        RetryPlan {
            attempt: 0,
            max_attempts: self.max_attempts.max(1),
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier.max(1.0),
        }
    }

    /// Jitter factor clamped so a jittered delay never exceeds the next
    /// un-jittered one.
    fn effective_jitter(&self) -> f64 {
        self.jitter.clamp(0.0, (self.multiplier - 1.0).max(0.0))
    }
}

/// Position within a retry sequence. Pure value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPlan {
    /// Zero-based number of attempts already made.
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPlan {
    /// `min(base_delay * multiplier^attempt, max_delay)`.
    pub fn backoff(&self) -> Duration {
        let exp = self.multiplier.powi(self.attempt.min(i32::MAX as u32) as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        if !raw.is_finite() || raw >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(raw)
    }

    /// Backoff plus `jitter * sample` of itself, capped at `max_delay`.
    ///
    /// `sample` is expected in `[0, 1)`.
    pub fn delay_with_jitter(&self, jitter: f64, sample: f64) -> Duration {
        let backoff = self.backoff();
        let jittered = backoff.mul_f64(1.0 + jitter * sample.clamp(0.0, 1.0));
        jittered.min(self.max_delay)
    }

    /// Whether another attempt is allowed after the current one.
    pub const fn can_retry(&self) -> bool {
        self.attempt + 1 < self.max_attempts
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self
        }
    }
}

/// Executes calls under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort backoff sleeps when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `call` receives the zero-based attempt number.
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<T, OutboundError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.execute_gated(|_| std::future::ready(Ok(())), call).await
    }

    /// Like [`Self::execute`], but awaits `gate` before every attempt.
    ///
    /// The gate runs outside the attempt deadline, so waiting on it never
    /// counts as a timeout. A gate error is classified like a call error.
    pub async fn execute_gated<T, G, GFut, F, Fut>(
        &self,
        mut gate: G,
        mut call: F,
    ) -> Result<T, OutboundError>
    where
        G: FnMut(u32) -> GFut,
        GFut: Future<Output = Result<(), CallError>>,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut plan = self.policy.plan();
        let jitter = self.policy.effective_jitter();

        loop {
            let outcome = match gate(plan.attempt).await {
                Err(e) => Err(e),
                Ok(()) => match self.policy.attempt_timeout {
                    Some(limit) => tokio::time::timeout(limit, call(plan.attempt))
                        .await
                        .unwrap_or(Err(CallError::Timeout)),
                    None => call(plan.attempt).await,
                },
            };

            let failure = match outcome {
                Ok(value) => {
                    if plan.attempt > 0 {
                        debug!(attempt = plan.attempt + 1, "Call succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(CallError::Cancelled) => return Err(OutboundError::Cancelled),
                Err(e) if !e.is_retryable() => {
                    warn!(attempt = plan.attempt + 1, error = %e, "Call failed fatally");
                    return Err(OutboundError::Fatal(e));
                }
                Err(e) => e,
            };

            if !plan.can_retry() {
                error!(
                    attempts = plan.max_attempts,
                    error = %failure,
                    "Retry attempts exhausted"
                );
                return Err(OutboundError::RetryExhausted {
                    attempts: plan.max_attempts,
                    last: failure,
                });
            }

            let delay = failure
                .retry_after()
                .unwrap_or_else(|| plan.delay_with_jitter(jitter, rand::thread_rng().gen()));
            debug!(
                attempt = plan.attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Retrying after retryable failure"
            );

            tokio::select! {
                () = self.cancel.cancelled() => return Err(OutboundError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            plan = plan.next();
        }
    }
}
