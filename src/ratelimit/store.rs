//! Window counter storage.
//!
//! A [`WindowCounterStore`] owns every counter. Increments are atomic per
//! (identity, window) so concurrent requests from one client are never
//! under- or over-counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::identity::{ClientIdentity, CounterKey};
use super::window::{Clock, SystemClock, Window};
use crate::error::Result;

/// Purge elapsed windows every N increments to bound memory growth.
const PURGE_INTERVAL: u64 = 1000;

/// Counter state for one client in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests counted so far in this window
    pub count: u64,
    /// When the window rolls over
    pub reset_at: DateTime<Utc>,
}

/// Shared storage for per-window request counters.
#[async_trait]
pub trait WindowCounterStore: Send + Sync {
    /// Count one request for `identity` in the current window and return the
    /// new total.
    async fn increment_and_check(
        &self,
        identity: &ClientIdentity,
        window: Window,
    ) -> Result<WindowCount>;

    /// Read the current window's count without incrementing it.
    async fn current(&self, identity: &ClientIdentity, window: Window) -> Result<WindowCount>;
}

/// In-process counter store backed by a sharded concurrent map.
///
/// Each increment holds the shard lock for its key only, so distinct clients
/// never contend on a global lock.
#[derive(Debug)]
pub struct MemoryCounterStore {
    counters: DashMap<CounterKey, u64>,
    clock: Arc<dyn Clock>,
    ops: AtomicU64,
}

impl MemoryCounterStore {
    /// Create a store reading the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store reading the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
            ops: AtomicU64::new(0),
        }
    }

    /// Drop every counter whose window has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now().timestamp();
        let before = self.counters.len();
        self.counters.retain(|key, _| key.window_end() > now);
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!(removed = removed, "Purged expired window counters");
        }
        removed
    }

    /// Number of live counters.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    fn maybe_purge(&self) {
        let ops = self.ops.fetch_add(1, Ordering::Relaxed);
        if ops > 0 && ops % PURGE_INTERVAL == 0 {
            self.purge_expired();
        }
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowCounterStore for MemoryCounterStore {
    async fn increment_and_check(
        &self,
        identity: &ClientIdentity,
        window: Window,
    ) -> Result<WindowCount> {
        // Must run before the entry guard below is taken; retain() locks every shard.
        self.maybe_purge();

        let bounds = window.bounds(self.clock.now());
        let key = CounterKey::new(identity, window, &bounds);

        let count = {
            let mut entry = self.counters.entry(key).or_insert(0);
            *entry += 1;
            *entry
        };

        trace!(identity = %identity, count = count, window_start = bounds.start, "Incremented counter");

        Ok(WindowCount {
            count,
            reset_at: bounds.reset_at,
        })
    }

    async fn current(&self, identity: &ClientIdentity, window: Window) -> Result<WindowCount> {
        let bounds = window.bounds(self.clock.now());
        let key = CounterKey::new(identity, window, &bounds);
        let count = self.counters.get(&key).map(|c| *c).unwrap_or(0);

        Ok(WindowCount {
            count,
            reset_at: bounds.reset_at,
        })
    }
}
