use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

/// Short-lived "have we seen this message id" cache.
///
/// Channels redeliver webhooks; the first sighting of a key inside the TTL
/// window wins and every later one inside the window is reported as a repeat.
pub struct DedupCache {
    seen: DashMap<String, Instant>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns true if `key` was already marked within the TTL. Otherwise
    /// marks it and returns false. The check-and-mark is atomic per key.
    pub fn is_repeated(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.seen.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                if now.duration_since(*slot.get()) < self.ttl {
                    true
                } else {
                    slot.insert(now);
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                false
            }
        }
    }

    /// Drop expired marks. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.seen.len();
        self.seen.retain(|_, marked| now.duration_since(*marked) < self.ttl);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Periodically purge expired marks so the map does not grow without bound.
pub fn start_sweeper(cache: Arc<DedupCache>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = cache.purge_expired();
            if removed > 0 {
                tracing::debug!(removed = removed, "dedup sweep");
            }
        }
    })
}
