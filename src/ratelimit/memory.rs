//! In-process counter store.
//!
//! Each counter lives in a `DashMap` entry; the shard lock held by `entry()`
//! makes increment-and-maybe-expire a single step, which is the same
//! guarantee the Redis backend gets from its Lua script.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::store::{CounterStore, StoreError, WindowCounter};

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    expires_at: Instant,
}

impl Slot {
    fn fresh(window: Duration, now: Instant) -> Self {
        Self {
            count: 0,
            expires_at: now + window,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn snapshot(&self, now: Instant) -> WindowCounter {
        WindowCounter {
            count: self.count,
            ttl: self.expires_at.saturating_duration_since(now),
        }
    }
}

/// A counter store kept in process memory.
///
/// Suitable for tests and single-instance deployments. Expired counters are
/// replaced lazily on access; call [`MemoryStore::purge_expired`] from time
/// to time to reclaim memory for identifiers that never come back.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired counter, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        before.saturating_sub(self.slots.len())
    }

    /// Get the number of live and not yet purged counters.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCounter, StoreError> {
        let now = Instant::now();
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::fresh(window, now));

        if slot.is_expired(now) {
            trace!(key = %key, "Window expired, starting a new one");
            *slot = Slot::fresh(window, now);
        }

        slot.count += 1;
        Ok(slot.snapshot(now))
    }

    async fn peek(&self, key: &str) -> Result<Option<WindowCounter>, StoreError> {
        let now = Instant::now();
        Ok(self
            .slots
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.snapshot(now)))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.slots.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let before = self.slots.len();
        self.slots.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.slots.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_increment_creates_counter() {
        let store = MemoryStore::new();

        let counter = store.increment("k", MINUTE).await.unwrap();

        assert_eq!(counter.count, 1);
        assert!(counter.ttl <= MINUTE);
        assert!(counter.ttl > Duration::from_secs(59));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_increment_keeps_expiry() {
        let store = MemoryStore::new();

        let first = store.increment("k", MINUTE).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // A longer window on a live key must not push the expiry out
        let second = store.increment("k", Duration::from_secs(600)).await.unwrap();

        assert_eq!(second.count, 2);
        assert!(second.ttl < first.ttl);
    }

    #[tokio::test]
    async fn test_expired_counter_restarts() {
        let store = MemoryStore::new();
        let window = Duration::from_millis(50);

        store.increment("k", window).await.unwrap();
        store.increment("k", window).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(store.peek("k").await.unwrap(), None);
        let counter = store.increment("k", window).await.unwrap();
        assert_eq!(counter.count, 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_increment() {
        let store = MemoryStore::new();
        assert_eq!(store.peek("k").await.unwrap(), None);

        store.increment("k", MINUTE).await.unwrap();
        let seen = store.peek("k").await.unwrap().unwrap();
        let seen_again = store.peek("k").await.unwrap().unwrap();

        assert_eq!(seen.count, 1);
        assert_eq!(seen_again.count, 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.increment("k", MINUTE).await.unwrap();

        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let store = MemoryStore::new();
        store.increment("a:ip:1", MINUTE).await.unwrap();
        store.increment("a:ip:2", MINUTE).await.unwrap();
        store.increment("b:ip:1", MINUTE).await.unwrap();

        assert_eq!(store.delete_prefix("a:").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.peek("b:ip:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.increment("short", Duration::from_millis(10)).await.unwrap();
        store.increment("long", MINUTE).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_distinct() {
        let store = Arc::new(MemoryStore::new());

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("k", MINUTE).await.unwrap().count })
            })
            .collect();

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();

        assert_eq!(counts, (1..=64).collect::<Vec<u64>>());
    }
}
