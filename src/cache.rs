//! Short-lived memoization of range-bounded reads
//!
//! Entries are keyed by operation, backend, serialized arguments and the
//! bucket bounds the range resolves to, so two requests that scan the same
//! buckets share an entry. A range still receiving data gets the live TTL;
//! anything older is immutable and kept for the historical TTL.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cached::{Cached, CanExpire, ExpiringValueCache};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::CacheConfig;
use crate::db::{resolve_fact_table, FactTable, TimeRange};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    operation: &'static str,
    backend_id: i64,
    generation: u64,
    args: String,
    table: FactTable,
    first_bucket: String,
    last_bucket: String,
}

#[derive(Clone)]
struct CacheEntry {
    value: Arc<dyn Any + Send + Sync>,
    expires_at: Instant,
}

impl CanExpire for CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

struct Inner {
    store: ExpiringValueCache<CacheKey, CacheEntry>,
    /// Bumped on every delete for a backend; stale keys never match again
    generations: HashMap<i64, u64>,
}

impl Inner {
    fn generation(&self, backend_id: i64) -> u64 {
        self.generations.get(&backend_id).copied().unwrap_or(0)
    }
}

pub struct RangeQueryCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
}

impl RangeQueryCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            config: config.clone(),
            inner: Mutex::new(Inner {
                store: ExpiringValueCache::with_size(config.max_entries.max(1)),
                generations: HashMap::new(),
            }),
        }
    }

    pub fn ttl_for(&self, range: &TimeRange, now: DateTime<Utc>) -> Duration {
        let tolerance = chrono::Duration::seconds(i64::try_from(self.config.live_tolerance_secs).unwrap_or(i64::MAX));
        if range.end >= now - tolerance {
            self.config.live_ttl()
        } else {
            self.config.historical_ttl()
        }
    }

    /// Return the cached result of `operation` or run `load` and remember it.
    /// Unranged reads and a disabled cache always run `load`.
    pub async fn get_or_load<T, A, F, Fut>(
        &self,
        operation: &'static str,
        backend_id: i64,
        args: &A,
        range: Option<&TimeRange>,
        load: F,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        A: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(range) = range.filter(|_| self.config.enabled) else {
            return load().await;
        };

        let table = resolve_fact_table(range);
        let (first_bucket, last_bucket) = range.bucket_bounds(table);
        let args = serde_json::to_string(args)?;

        let key = {
            let mut inner = self.inner.lock().await;
            let key = CacheKey {
                operation,
                backend_id,
                generation: inner.generation(backend_id),
                args,
                table,
                first_bucket,
                last_bucket,
            };
            let hit = inner
                .store
                .cache_get(&key)
                .and_then(|entry| entry.value.downcast_ref::<T>().cloned());
            if let Some(value) = hit {
                debug!(operation, backend_id, "Range cache hit");
                return Ok(value);
            }
            key
        };

        let value = load().await?;

        let ttl = self.ttl_for(range, Utc::now());
        let mut inner = self.inner.lock().await;
        // A delete that landed while loading makes this result stale
        if inner.generation(backend_id) == key.generation {
            inner.store.cache_set(
                key,
                CacheEntry {
                    value: Arc::new(value.clone()),
                    expires_at: Instant::now() + ttl,
                },
            );
        }
        Ok(value)
    }

    /// Forget every cached read of `backend_id`.
    pub async fn invalidate_backend(&self, backend_id: i64) {
        let mut inner = self.inner.lock().await;
        *inner.generations.entry(backend_id).or_insert(0) += 1;
        debug!(backend_id, "Invalidated range cache");
    }

    pub async fn clear(&self) {
        self.inner.lock().await.store.cache_clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.store.cache_size()
    }

    /// Drop expired entries.
    pub async fn sweep(&self) {
        self.inner.lock().await.store.flush();
    }

    /// Periodic sweep of expired entries.
    pub fn start_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let every = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }
}
