//! Deferred Follow-ups
//!
//! Providers expect a fast acknowledgement, while the real answer to an event
//! (a reply, a status update) may take longer. Handlers hand that work to
//! [`HandlerContext::defer`], which spawns it as its own task with a
//! cancellation token and a completion channel.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a follow-up produced no value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FollowUpError {
    #[error("follow-up was cancelled")]
    Cancelled,
    #[error("follow-up task panicked")]
    Panicked,
}

/// Handle to a deferred task.
pub struct FollowUp<T> {
    name: String,
    cancel: CancellationToken,
    done: oneshot::Receiver<Result<T, FollowUpError>>,
}

impl<T> FollowUp<T> {
    /// Request cancellation. The task stops at its next await point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the task to finish.
    pub async fn join(self) -> Result<T, FollowUpError> {
        self.done.await.unwrap_or(Err(FollowUpError::Panicked))
    }
}

/// Per-dispatch context handed to every handler.
#[derive(Clone)]
pub struct HandlerContext {
    delivery_id: Arc<str>,
    cancel: CancellationToken,
}

impl HandlerContext {
    pub(crate) fn new(delivery_id: &str, parent: &CancellationToken) -> Self {
        Self {
            delivery_id: Arc::from(delivery_id),
            cancel: parent.child_token(),
        }
    }

    pub fn delivery_id(&self) -> &str {
        &self.delivery_id
    }

    /// Token cancelled when the gateway shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `work` after the handler returns, detached from the acknowledgement.
    pub fn defer<T, F>(&self, name: impl Into<String>, work: F) -> FollowUp<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let name = name.into();
        let cancel = self.cancel.child_token();
        let (tx, rx) = oneshot::channel();

        let task_cancel = cancel.clone();
        let task_name = name.clone();
        let delivery_id = Arc::clone(&self.delivery_id);
        tokio::spawn(async move {
            let inner = tokio::spawn(async move {
                tokio::select! {
                    () = task_cancel.cancelled() => Err(FollowUpError::Cancelled),
                    value = work => Ok(value),
                }
            });
            let result = match inner.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        delivery_id = %delivery_id,
                        follow_up = %task_name,
                        "Follow-up task panicked: {}", e
                    );
                    Err(FollowUpError::Panicked)
                }
            };
            if matches!(result, Err(FollowUpError::Cancelled)) {
                debug!(delivery_id = %delivery_id, follow_up = %task_name, "Follow-up cancelled");
            }
            let _ = tx.send(result);
        });

        FollowUp {
            name,
            cancel,
            done: rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn deferred_work_completes() {
        let root = CancellationToken::new();
        let ctx = HandlerContext::new("d-1", &root);
        let follow_up = ctx.defer("reply", async { 40 + 2 });
        assert_eq!(follow_up.name(), "reply");
        assert_eq!(follow_up.join().await, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_pending_work() {
        let root = CancellationToken::new();
        let ctx = HandlerContext::new("d-1", &root);
        let follow_up = ctx.defer("slow", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        follow_up.cancel();
        assert_eq!(follow_up.join().await, Err(FollowUpError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn root_cancellation_reaches_follow_ups() {
        let root = CancellationToken::new();
        let ctx = HandlerContext::new("d-1", &root);
        let follow_up = ctx.defer("slow", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        root.cancel();
        assert_eq!(follow_up.join().await, Err(FollowUpError::Cancelled));
        assert!(ctx.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn panicking_work_is_reported() {
        let root = CancellationToken::new();
        let ctx = HandlerContext::new("d-1", &root);
        let follow_up = ctx.defer("boom", async {
            panic!("handler bug");
        });
        let result: Result<(), _> = follow_up.join().await;
        assert_eq!(result, Err(FollowUpError::Panicked));
    }
}
