//! In-memory expiring cache.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{task::AbortHandle, time::Instant};

use super::{CacheError, SessionCache};

struct Record {
    value: String,
    expires_at: Instant,
    generation: u64,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

struct Timer {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct Shared {
    data: DashMap<String, Record>,
    timers: DashMap<String, Timer>,
    generations: AtomicU64,
}

impl Shared {
    /// Remove `key` only if it still holds the write identified by `generation`.
    fn expire(&self, key: &str, generation: u64) {
        if self
            .data
            .remove_if(key, |_, record| record.generation == generation)
            .is_some()
        {
            tracing::debug!(key, "Cache entry expired");
        }
        self.timers
            .remove_if(key, |_, timer| timer.generation == generation);
    }
}

/// Process-local cache with per-key expiry timers.
///
/// Every write schedules a timer that deletes the entry when its TTL runs
/// out; rewriting a key replaces its timer. Reads also check the deadline,
/// so a late timer never exposes a stale value. A timer only ever removes
/// the exact write it was created for, which keeps cancellation race-free:
/// a timer firing after a delete or rewrite has nothing left to remove.
///
/// All timers belong to this instance and are aborted by
/// [`SessionCache::shutdown`] or on drop.
pub struct MemoryCache {
    shared: Arc<Shared>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
        }
    }

    /// Number of expiry timers currently scheduled.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.shared.timers.len()
    }

    fn next_generation(&self) -> u64 {
        self.shared.generations.fetch_add(1, Ordering::Relaxed)
    }

    /// Schedule expiry for one write, replacing the key's previous timer.
    fn schedule(&self, key: &str, generation: u64, ttl: Duration) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let owned_key = key.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(shared) = weak.upgrade() {
                shared.expire(&owned_key, generation);
            }
        });

        let timer = Timer {
            generation,
            handle: task.abort_handle(),
        };
        // A newer write may have scheduled its timer first; keep the newest.
        match self.shared.timers.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().generation > generation {
                    timer.handle.abort();
                } else {
                    occupied.insert(timer).handle.abort();
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(timer);
            }
        }
    }

    fn cancel_timer(&self, key: &str) {
        if let Some((_, timer)) = self.shared.timers.remove(key) {
            timer.handle.abort();
        }
    }

    fn cancel_all(&self) {
        self.shared.timers.retain(|_, timer| {
            timer.handle.abort();
            false
        });
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[async_trait]
impl SessionCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        Ok(self
            .shared
            .data
            .get(key)
            .filter(|record| record.is_live(now))
            .map(|record| record.value.clone()))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let generation = self.next_generation();
        let record = Record {
            value,
            expires_at: now + ttl,
            generation,
        };

        // The entry guard holds the shard lock, so concurrent creators for
        // the same key are serialized here.
        match self.shared.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(record);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
            }
        }
        self.schedule(key, generation, ttl);
        Ok(true)
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        let Some(mut record) = self.shared.data.get_mut(key) else {
            return Ok(false);
        };
        if !record.is_live(now) {
            return Ok(false);
        }

        let generation = self.next_generation();
        record.expires_at = now + ttl;
        record.generation = generation;
        drop(record);

        self.schedule(key, generation, ttl);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        let removed = self.shared.data.remove(key);
        self.cancel_timer(key);
        Ok(removed.is_some_and(|(_, record)| record.is_live(now)))
    }

    async fn shutdown(&self) {
        self.cancel_all();
    }
}
