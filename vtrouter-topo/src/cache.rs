//! A generic single-flight, TTL-bounded cache over an async fetch function,
//! parameterized over the three read operations
//! (`srv_keyspace_names`/`srv_keyspace`/`end_points`) the resilient topology
//! server wraps. Vitess's `srvtopo` hand-duplicates this logic per
//! operation; this crate generalizes it once since the locking/TTL/
//! negative-cache behavior is identical across the three.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use vtrouter_errors::{ErrorKind, RouterError, RouterResult};

use crate::metrics;

struct CacheEntry<V> {
    value: Option<V>,
    error: Option<(ErrorKind, String)>,
    fetched_at: Option<Instant>,
}

impl<V> Default for CacheEntry<V> {
    fn default() -> Self {
        Self {
            value: None,
            error: None,
            fetched_at: None,
        }
    }
}

/// A single-flight discipline cache: each key owns its own async lock, held
/// across the backend call, so concurrent callers on the same key serialize
/// while distinct keys are fetched concurrently. The map lock is only ever
/// held long enough to create a missing per-key entry.
pub struct SingleFlightCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, Arc<AsyncMutex<CacheEntry<V>>>>>,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn entry_for(&self, key: &K) -> Arc<AsyncMutex<CacheEntry<V>>> {
        if let Some(entry) = self.entries.read().get(key) {
            return entry.clone();
        }
        let mut entries = self.entries.write();
        entries.entry(key.clone()).or_default().clone()
    }

    /// Returns the cached value if still fresh. Otherwise calls `fetch`
    /// (exactly once per stale window, serialized on `key`'s lock) and
    /// applies the cache contract: on success, stores the value and bumps
    /// `query`; on failure with a prior value, returns the prior value and
    /// bumps `cached`; on failure with no prior value, caches and surfaces
    /// the error and bumps `error`.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, operation: &str, fetch: F) -> RouterResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RouterResult<V>>,
    {
        let entry = self.entry_for(&key);
        let mut guard = entry.lock().await;

        if let Some(fetched_at) = guard.fetched_at {
            if fetched_at.elapsed() < self.ttl {
                return Self::cached_result(&guard);
            }
        }

        match fetch().await {
            Ok(value) => {
                guard.value = Some(value.clone());
                guard.error = None;
                guard.fetched_at = Some(Instant::now());
                metrics::record_query(operation);
                Ok(value)
            }
            Err(err) => {
                guard.fetched_at = Some(Instant::now());
                if let Some(prior) = guard.value.clone() {
                    warn!(operation, error = %err, "topology fetch failed, serving cached value");
                    metrics::record_cached(operation);
                    Ok(prior)
                } else {
                    let kind = err.kind();
                    guard.error = Some((kind, err.to_string()));
                    metrics::record_error(operation);
                    Err(err)
                }
            }
        }
    }

    fn cached_result(guard: &CacheEntry<V>) -> RouterResult<V> {
        if let Some(value) = &guard.value {
            Ok(value.clone())
        } else if let Some((kind, message)) = &guard.error {
            Err(RouterError::Generic {
                kind: *kind,
                message: message.clone(),
            })
        } else {
            unreachable!("fetched_at is only set once value or error is populated")
        }
    }
}
