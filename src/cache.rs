//! Read-through, per-clinic TTL cache for read paths that sit beside the
//! snapshot engine. Process-scoped: built once, dropped at shutdown, never
//! persisted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::LOG_TARGET;

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut offset) = self.offset.lock() {
            *offset += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = self.offset.lock().map(|o| *o).unwrap_or_default();
        self.origin + offset
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub size: usize,
    /// Percentage of lookups served from the cache.
    pub hit_rate: f64,
}

struct Entry<T> {
    value: Arc<T>,
    expires: Instant,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    invalidations: u64,
}

pub struct SnapshotCache<T> {
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, Entry<T>>>,
    counters: Mutex<Counters>,
}

fn cache_key(clinic_id: &str) -> String {
    format!("snapshot:{clinic_id}")
}

impl<T: Send + Sync + 'static> SnapshotCache<T> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: RwLock::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
        }
    }

    fn count(&self, f: impl FnOnce(&mut Counters)) {
        if let Ok(mut counters) = self.counters.lock() {
            f(&mut counters);
        }
    }

    fn fresh(&self, clinic_id: &str) -> Option<Arc<T>> {
        let now = self.clock.now();
        let entries = self.entries.read().ok()?;
        entries
            .get(&cache_key(clinic_id))
            .filter(|e| e.expires > now)
            .map(|e| Arc::clone(&e.value))
    }

    /// Cached value for the clinic, or the loader's result, stored for `ttl`.
    /// A loader error is returned as-is and nothing is cached.
    pub async fn get_or_load<F, Fut, E>(
        &self,
        clinic_id: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.fresh(clinic_id) {
            self.count(|c| c.hits += 1);
            debug!(target: LOG_TARGET, event = "cache_hit", clinic_id = %clinic_id);
            return Ok(value);
        }
        self.count(|c| c.misses += 1);
        debug!(target: LOG_TARGET, event = "cache_miss", clinic_id = %clinic_id);

        let value = Arc::new(loader().await?);
        let expires = self.clock.now() + ttl;
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                cache_key(clinic_id),
                Entry {
                    value: Arc::clone(&value),
                    expires,
                },
            );
        }
        Ok(value)
    }

    pub fn invalidate(&self, clinic_id: &str) {
        let removed = self
            .entries
            .write()
            .map(|mut entries| entries.remove(&cache_key(clinic_id)).is_some())
            .unwrap_or(false);
        if removed {
            self.count(|c| c.invalidations += 1);
            debug!(target: LOG_TARGET, event = "cache_invalidated", clinic_id = %clinic_id);
        }
    }

    pub fn invalidate_all(&self) {
        let removed = self
            .entries
            .write()
            .map(|mut entries| {
                let n = entries.len();
                entries.clear();
                n
            })
            .unwrap_or(0);
        self.count(|c| c.invalidations += removed as u64);
        info!(target: LOG_TARGET, event = "cache_invalidated_all", entries = removed);
    }

    /// Drop expired entries, returning how many went.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let cleaned = self
            .entries
            .write()
            .map(|mut entries| {
                let before = entries.len();
                entries.retain(|_, e| e.expires > now);
                before - entries.len()
            })
            .unwrap_or(0);
        if cleaned > 0 {
            debug!(target: LOG_TARGET, event = "cache_cleanup", removed = cleaned);
        }
        cleaned
    }

    pub fn contains(&self, clinic_id: &str) -> bool {
        self.fresh(clinic_id).is_some()
    }

    pub fn ttl_remaining(&self, clinic_id: &str) -> Option<Duration> {
        let now = self.clock.now();
        let entries = self.entries.read().ok()?;
        entries
            .get(&cache_key(clinic_id))
            .and_then(|e| e.expires.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    pub fn stats(&self) -> CacheStats {
        let size = self.entries.read().map(|e| e.len()).unwrap_or(0);
        let (hits, misses, invalidations) = self
            .counters
            .lock()
            .map(|c| (c.hits, c.misses, c.invalidations))
            .unwrap_or_default();
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            invalidations,
            size,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 * 100.0 / total as f64
            },
        }
    }

    /// Run `cleanup` every `interval` until the handle is aborted.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.cleanup();
            }
        })
    }
}

impl<T: Send + Sync + 'static> Default for SnapshotCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
