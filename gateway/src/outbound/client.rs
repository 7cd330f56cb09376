//! Outbound Gateway
//!
//! Schedules calls against a remote service: a call runs immediately when the
//! limiter grants and nothing is waiting ahead of it, otherwise it joins the
//! priority queue. A single drain task serves the queue in order, and every
//! execution goes through the retry executor.

use std::sync::{Arc, Weak};

use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{CallError, OutboundError};
use super::queue::{QueuedCall, RequestQueue};
use super::retry::{RetryExecutor, RetryPolicy};
use super::transport::Transport;
use crate::ratelimit::{RateLimitHint, RateLimiter};

/// Scheduling settings.
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    pub queue_size: usize,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            max_in_flight: 8,
            retry: RetryPolicy::default(),
        }
    }
}

impl OutboundConfig {
    /// Creates configuration from environment variables.
    ///
    /// - `OUTBOUND_QUEUE_SIZE` (default: 1000)
    /// - `OUTBOUND_MAX_IN_FLIGHT` (default: 8)
    /// - `RETRY_*` (see [`RetryPolicy::from_env`])
    pub fn from_env() -> Self {
        let mut config = Self {
            retry: RetryPolicy::from_env(),
            ..Self::default()
        };
        if let Some(size) = std::env::var("OUTBOUND_QUEUE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.queue_size = size;
        }
        if let Some(n) = std::env::var("OUTBOUND_MAX_IN_FLIGHT")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
        {
            config.max_in_flight = n;
        }
        config
    }
}

type Reply<R> = oneshot::Sender<Result<R, OutboundError>>;

struct Pending<T: Transport> {
    request: Arc<T::Request>,
    cost: u32,
    reply: Reply<T::Response>,
}

trait CancelQueued: Send + Sync {
    fn cancel_queued(&self, id: Uuid) -> bool;
}

/// Handle to a submitted call.
pub struct CallHandle<R> {
    id: Uuid,
    rx: oneshot::Receiver<Result<R, OutboundError>>,
    queue: Option<Weak<dyn CancelQueued>>,
}

impl<R> CallHandle<R> {
    fn resolved(result: Result<R, OutboundError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self {
            id: Uuid::now_v7(),
            rx,
            queue: None,
        }
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Remove the call if it is still queued. Returns `false` once it has
    /// started (or already finished); the transport is never invoked for a
    /// cancelled call.
    pub fn cancel(&self) -> bool {
        self.queue
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|queue| queue.cancel_queued(self.id))
    }

    /// Wait for the terminal result.
    pub async fn wait(self) -> Result<R, OutboundError> {
        self.rx.await.unwrap_or(Err(OutboundError::Cancelled))
    }
}

struct Shared<T: Transport> {
    transport: T,
    limiter: RateLimiter,
    queue: RequestQueue<Pending<T>>,
    slots: Arc<Semaphore>,
    executor: RetryExecutor,
    shutdown: CancellationToken,
}

impl<T: Transport> CancelQueued for Shared<T> {
    fn cancel_queued(&self, id: Uuid) -> bool {
        let removed = self.queue.cancel(id);
        if removed {
            debug!(call_id = %id, "Queued call cancelled");
        }
        removed
    }
}

/// Rate-aware, retrying client for one remote credential or endpoint.
///
/// Cheap to clone. Owns its limiter and queue; nothing is shared with other
/// gateways unless the caller passes the same [`RateLimiter`] in.
pub struct OutboundGateway<T: Transport> {
    shared: Arc<Shared<T>>,
    drain: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl<T: Transport> Clone for OutboundGateway<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            drain: Arc::clone(&self.drain),
        }
    }
}

impl<T: Transport> OutboundGateway<T> {
    /// Build the gateway and start its drain task. Must be called inside a
    /// tokio runtime.
    pub fn new(transport: T, limiter: RateLimiter, config: OutboundConfig) -> Self {
        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared {
            transport,
            limiter,
            queue: RequestQueue::new(config.queue_size),
            slots: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            executor: RetryExecutor::new(config.retry).with_cancellation(shutdown.clone()),
            shutdown,
        });
        let handle = tokio::spawn(drain_loop(Arc::clone(&shared)));
        info!(
            queue_size = config.queue_size,
            max_in_flight = config.max_in_flight,
            "Outbound gateway started"
        );
        Self {
            shared,
            drain: Arc::new(std::sync::Mutex::new(Some(handle))),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.shared.limiter
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Feed authoritative rate-limit headers from a response obtained
    /// outside the gateway.
    pub fn update_from_server_hint(&self, hint: &RateLimitHint) {
        self.shared.limiter.apply_hint(hint);
        self.shared.queue.wake();
    }

    /// Schedule a call. Higher `priority` is served first.
    #[tracing::instrument(skip(self, request))]
    pub fn submit(&self, request: T::Request, priority: i32) -> CallHandle<T::Response> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return CallHandle::resolved(Err(OutboundError::ShuttingDown));
        }

        let cost = shared.transport.cost(&request);
        if shared.limiter.is_enabled() && cost > shared.limiter.capacity() {
            return CallHandle::resolved(Err(OutboundError::CostExceedsCapacity {
                cost,
                capacity: shared.limiter.capacity(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        let pending = Pending {
            request: Arc::new(request),
            cost,
            reply: tx,
        };

        // Fast path: nothing waiting, a free slot, and tokens available.
        if shared.queue.is_empty() {
            if let Ok(permit) = Arc::clone(&shared.slots).try_acquire_owned() {
                if shared.limiter.try_acquire(cost).granted {
                    let id = Uuid::now_v7();
                    debug!(call_id = %id, "Running call immediately");
                    tokio::spawn(run(Arc::clone(shared), permit, pending));
                    return CallHandle { id, rx, queue: None };
                }
            }
        }

        match shared.queue.enqueue(pending, priority) {
            Ok(id) => {
                debug!(call_id = %id, queued = shared.queue.len(), "Call queued");
                let weak: Weak<Shared<T>> = Arc::downgrade(shared);
                let weak: Weak<dyn CancelQueued> = weak;
                CallHandle {
                    id,
                    rx,
                    queue: Some(weak),
                }
            }
            Err(e) => {
                warn!(capacity = shared.queue.capacity(), "Outbound queue full, rejecting call");
                CallHandle::resolved(Err(e))
            }
        }
    }

    /// Stop the drain task. Calls still queued resolve to
    /// [`OutboundError::ShuttingDown`]; running calls finish their current
    /// attempt but are not retried.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let handle = self
            .drain
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Drain task ended abnormally: {}", e);
            }
        }
    }
}

/// Serve the queue: one call at a time, in priority-then-arrival order.
async fn drain_loop<T: Transport>(shared: Arc<Shared<T>>) {
    loop {
        if shared.queue.is_empty() {
            tokio::select! {
                () = shared.shutdown.cancelled() => break,
                () = shared.queue.notified() => continue,
            }
        }

        let permit = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            permit = Arc::clone(&shared.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let mut wait = None;
        let popped = shared.queue.pop_if(|call| {
            if call.payload.reply.is_closed() {
                return true;
            }
            let result = shared.limiter.try_acquire(call.payload.cost);
            wait = result.retry_after;
            result.granted
        });

        match popped {
            Some(call) if call.payload.reply.is_closed() => {
                debug!(call_id = %call.id, "Dropping abandoned call");
            }
            Some(call) => {
                log_dequeue(&call);
                tokio::spawn(run(Arc::clone(&shared), permit, call.payload));
            }
            None => {
                drop(permit);
                match wait {
                    Some(wait) => tokio::select! {
                        () = shared.shutdown.cancelled() => break,
                        () = shared.queue.notified() => {}
                        () = tokio::time::sleep(wait) => {}
                    },
                    None => tokio::select! {
                        () = shared.shutdown.cancelled() => break,
                        () = shared.queue.notified() => {}
                    },
                }
            }
        }
    }

    let abandoned = shared.queue.drain();
    if !abandoned.is_empty() {
        info!(count = abandoned.len(), "Rejecting queued calls on shutdown");
    }
    for call in abandoned {
        let _ = call.payload.reply.send(Err(OutboundError::ShuttingDown));
    }
    debug!("Outbound drain loop stopped");
}

fn log_dequeue<P>(call: &QueuedCall<P>) {
    debug!(
        call_id = %call.id,
        priority = call.priority,
        waited_ms = call.enqueued_at.elapsed().as_millis() as u64,
        "Dequeued call"
    );
}

/// Execute one call (first attempt already paid for) and deliver the result.
async fn run<T: Transport>(shared: Arc<Shared<T>>, permit: OwnedSemaphorePermit, pending: Pending<T>) {
    let Pending {
        request,
        cost,
        reply,
    } = pending;

    // Retries pay for fresh tokens before the attempt deadline starts.
    let result = shared
        .executor
        .execute_gated(
            |attempt| {
                let shared = Arc::clone(&shared);
                async move {
                    if attempt > 0 {
                        shared
                            .limiter
                            .acquire(cost, &shared.shutdown)
                            .await
                            .map_err(|_| CallError::Cancelled)?;
                    }
                    Ok::<(), CallError>(())
                }
            },
            |_| {
                let shared = Arc::clone(&shared);
                let request = Arc::clone(&request);
                async move {
                    match shared.transport.send(&request).await {
                        Ok(response) => {
                            if let Some(hint) = shared.transport.hint(&response) {
                                shared.limiter.apply_hint(&hint);
                            }
                            Ok(response)
                        }
                        Err(e) => {
                            if let CallError::RateLimited { retry_after } = &e {
                                shared
                                    .limiter
                                    .pause_for(retry_after.unwrap_or(shared.executor.policy().base_delay));
                            }
                            Err(e)
                        }
                    }
                }
            },
        )
        .await;

    drop(permit);
    shared.queue.wake();
    if reply.send(result).is_err() {
        debug!("Caller dropped handle before completion");
    }
}
