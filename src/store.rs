//! Shared counters for replay detection.
//!
//! The scoring core only sees the [`CounterStore`] capability, so a shared or
//! distributed store can replace the in-memory one.

use crate::error::{CloakerError, Result};
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Monotonic counters keyed by string.
///
/// Implementations must be safe under concurrent requests: `increment` is a
/// single atomic step, never a read-modify-write done by the caller.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add one to the counter and return the new count.
    async fn increment(&self, key: &str) -> Result<u64>;

    /// Current count, 0 if unknown or expired.
    async fn get(&self, key: &str) -> Result<u64>;
}

/// In-memory counters that expire after a fixed window.
///
/// Entries are only ever dropped by expiry. Once `capacity` keys are live,
/// `increment` on a new key fails with [`CloakerError::StoreFull`] instead of
/// evicting, so a counter never silently restarts at 1.
pub struct MemoryCounterStore {
    inner: Cache<String, Arc<AtomicU64>>,
    name: String,
    capacity: u64,
}

impl MemoryCounterStore {
    /// Create a new store. Counters reset `window` after their first increment.
    pub fn new(name: impl Into<String>, capacity: u64, window: Duration) -> Self {
        let inner = Cache::builder().time_to_live(window).build();

        Self {
            inner,
            name: name.into(),
            capacity,
        }
    }

    async fn is_full(&self) -> bool {
        // entry_count lags until pending expirations and inserts are applied
        self.inner.run_pending_tasks().await;
        self.inner.entry_count() >= self.capacity
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<u64> {
        if let Some(counter) = self.inner.get(key).await {
            return Ok(counter.fetch_add(1, Ordering::AcqRel) + 1);
        }
        if self.is_full().await {
            return Err(CloakerError::StoreFull {
                store: self.name.clone(),
                capacity: self.capacity,
            });
        }
        let counter = self
            .inner
            .get_with(key.to_string(), async { Arc::new(AtomicU64::new(0)) })
            .await;
        Ok(counter.fetch_add(1, Ordering::AcqRel) + 1)
    }

    async fn get(&self, key: &str) -> Result<u64> {
        Ok(self
            .inner
            .get(key)
            .await
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0))
    }
}
