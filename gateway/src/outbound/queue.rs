//! Request Queue
//!
//! Bounded stable priority queue of calls waiting for rate-limit capacity.
//! Higher priority is served first; equal priorities are served in enqueue
//! order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::error::OutboundError;

/// A call waiting in the queue.
#[derive(Debug)]
pub struct QueuedCall<P> {
    pub id: Uuid,
    pub enqueued_at: Instant,
    pub priority: i32,
    pub payload: P,
}

struct Entry<P> {
    seq: u64,
    call: QueuedCall<P>,
}

impl<P> PartialEq for Entry<P> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<P> Eq for Entry<P> {}

impl<P> PartialOrd for Entry<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Entry<P> {
    // Max-heap: higher priority wins, then the lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.call
            .priority
            .cmp(&other.call.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner<P> {
    heap: BinaryHeap<Entry<P>>,
    next_seq: u64,
}

/// Bounded priority queue with a wake-up signal for its consumer.
pub struct RequestQueue<P> {
    inner: Mutex<Inner<P>>,
    max_size: usize,
    notify: Notify,
}

impl<P> RequestQueue<P> {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            max_size,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a call. Fails fast with [`OutboundError::QueueFull`] at capacity.
    pub fn enqueue(&self, payload: P, priority: i32) -> Result<Uuid, OutboundError> {
        let id = Uuid::now_v7();
        {
            let mut inner = self.lock();
            if inner.heap.len() >= self.max_size {
                return Err(OutboundError::QueueFull {
                    capacity: self.max_size,
                });
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Entry {
                seq,
                call: QueuedCall {
                    id,
                    enqueued_at: Instant::now(),
                    priority,
                    payload,
                },
            });
        }
        self.notify.notify_one();
        Ok(id)
    }

    /// Remove the head of the queue.
    pub fn pop(&self) -> Option<QueuedCall<P>> {
        self.lock().heap.pop().map(|entry| entry.call)
    }

    /// Remove the head only if `ready` accepts it. The check runs under the
    /// queue lock, so nothing can overtake the head in between.
    pub fn pop_if(&self, ready: impl FnOnce(&QueuedCall<P>) -> bool) -> Option<QueuedCall<P>> {
        let mut inner = self.lock();
        let head = inner.heap.peek()?;
        if ready(&head.call) {
            inner.heap.pop().map(|entry| entry.call)
        } else {
            None
        }
    }

    /// Drop a still-queued call. Returns whether it was found.
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut inner = self.lock();
        let before = inner.heap.len();
        inner.heap.retain(|entry| entry.call.id != id);
        inner.heap.len() != before
    }

    /// Remove everything, in service order.
    pub fn drain(&self) -> Vec<QueuedCall<P>> {
        let heap = std::mem::take(&mut self.lock().heap);
        heap.into_sorted_vec()
            .into_iter()
            .rev()
            .map(|entry| entry.call)
            .collect()
    }

    /// Resolves after the next enqueue (or immediately if one happened
    /// since the last wake-up).
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Wake the consumer without enqueuing.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.max_size
    }
}
