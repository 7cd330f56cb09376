//! Delivery Deduplication
//!
//! Tracks recently seen delivery IDs in a `DashMap` so each provider delivery
//! is dispatched at most once within the retention window. Entries expire
//! after a fixed TTL, so insertion order is expiry order: an insertion log
//! next to the map lets sweeps and full-set eviction pop from the front
//! instead of scanning the whole map.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Deduplication settings.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long a delivery ID is remembered.
    pub ttl: Duration,
    /// Upper bound on remembered IDs.
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_entries: 100_000,
        }
    }
}

impl DedupConfig {
    /// Creates configuration from environment variables.
    ///
    /// - `DEDUP_TTL_SECS`: retention window (default: 3600)
    /// - `DEDUP_MAX_ENTRIES`: maximum remembered IDs (default: 100000)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = std::env::var("DEDUP_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.ttl = Duration::from_secs(secs);
        }
        if let Some(max) = std::env::var("DEDUP_MAX_ENTRIES")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.max_entries = max;
        }
        config
    }
}

/// Outcome of [`DeliveryDeduplicator::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub first_seen: bool,
}

/// Bounded, time-evicting set of delivery IDs.
pub struct DeliveryDeduplicator {
    seen: DashMap<String, Instant>,
    /// `(inserted_at, id)` oldest first. An entry whose timestamp no longer
    /// matches the map is stale and skipped when popped.
    order: Mutex<VecDeque<(Instant, String)>>,
    ttl: Duration,
    max_entries: usize,
}

impl DeliveryDeduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            seen: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            ttl: config.ttl,
            max_entries: config.max_entries.max(1),
        }
    }

    // Lock order is `order` then a map shard; never lock `order` while
    // holding a shard.
    fn order(&self) -> MutexGuard<'_, VecDeque<(Instant, String)>> {
        self.order.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically check-and-insert a delivery ID.
    ///
    /// Returns `first_seen = false` when the ID was observed within the
    /// retention window. Concurrent calls for the same ID have exactly one
    /// winner because the check and insert happen under the same shard lock.
    pub fn observe(&self, delivery_id: &str) -> Observation {
        let now = Instant::now();

        self.sweep_expired_at(now);
        if self.seen.len() >= self.max_entries && !self.seen.contains_key(delivery_id) {
            self.evict_oldest();
        }

        let first_seen = match self.seen.entry(delivery_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) >= self.ttl {
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        };

        if first_seen {
            self.order().push_back((now, delivery_id.to_string()));
        }
        Observation { first_seen }
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    fn sweep_expired_at(&self, now: Instant) -> usize {
        let mut order = self.order();
        let mut removed = 0;
        while let Some((inserted_at, _)) = order.front() {
            if now.duration_since(*inserted_at) < self.ttl {
                break;
            }
            if let Some((inserted_at, id)) = order.pop_front() {
                if self.seen.remove_if(&id, |_, at| *at == inserted_at).is_some() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, remaining = self.seen.len(), "Swept expired delivery IDs");
        }
        removed
    }

    /// Evict the oldest live entry to free a slot.
    fn evict_oldest(&self) {
        let mut order = self.order();
        while let Some((inserted_at, id)) = order.pop_front() {
            if self.seen.remove_if(&id, |_, at| *at == inserted_at).is_some() {
                warn!(
                    max_entries = self.max_entries,
                    evicted = %id,
                    "Dedup set full, evicted oldest unexpired delivery ID"
                );
                return;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Run [`Self::sweep_expired`] on a timer until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let dedup = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        dedup.sweep_expired();
                    }
                }
            }
            debug!("Dedup sweeper stopped");
        })
    }
}
