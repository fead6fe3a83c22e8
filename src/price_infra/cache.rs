use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use dashmap::DashMap;
use serde::Serialize;
use crate::types::aggregation::AggregationResult;
use crate::types::ids::FeedId;
use crate::types::timestamp::Timestamp;

#[derive(Clone, Debug)]
struct CacheEntry {
    result: Arc<AggregationResult>,
    stored_at: Timestamp,
}

impl CacheEntry {
    fn is_fresh(&self, now: Timestamp, ttl: Duration) -> bool {
        now.saturating_since(self.stored_at) < ttl
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
    pub hits: u64,
    pub misses: u64,
    pub ttl_ms: u64,
}

/// Last aggregation result per feed, valid for a fixed TTL.
pub struct ResultCache {
    ttl: Duration,
    entries: DashMap<FeedId, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        ResultCache {
            ttl,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, feed_id: &FeedId, now: Timestamp) -> Option<Arc<AggregationResult>> {
        let fresh = self
            .entries
            .get(feed_id)
            .filter(|entry| entry.is_fresh(now, self.ttl))
            .map(|entry| entry.result.clone());

        match fresh {
            Some(result) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%feed_id, "Cache hit");
                Some(result)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.entries.remove_if(feed_id, |_, entry| !entry.is_fresh(now, self.ttl));
                None
            }
        }
    }

    pub fn insert(&self, result: Arc<AggregationResult>, now: Timestamp) {
        let feed_id = result.feed_id.clone();
        self.entries.insert(feed_id, CacheEntry { result, stored_at: now });
    }

    pub fn invalidate(&self, feed_id: &FeedId) -> bool {
        let removed = self.entries.remove(feed_id).is_some();
        if removed {
            tracing::debug!(%feed_id, "Cache entry invalidated");
        }
        removed
    }

    /// Drops every entry, returning how many there were.
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        tracing::info!(entries = count, "Cache cleared");
        count
    }

    pub fn purge_expired(&self, now: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now, self.ttl));
        before.saturating_sub(self.entries.len())
    }

    pub fn stats(&self, now: Timestamp) -> CacheStats {
        let total = self.entries.len();
        let active = self
            .entries
            .iter()
            .filter(|entry| entry.is_fresh(now, self.ttl))
            .count();

        CacheStats {
            total,
            active,
            expired: total.saturating_sub(active),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ttl_ms: self.ttl.as_millis() as u64,
        }
    }
}
