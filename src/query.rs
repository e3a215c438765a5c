//! Pull queries: cached values fetched on demand, with concurrent requests
//! for the same key collapsed into one fetch.

use crate::cache::QueryCache;
use crate::config::SyncConfig;
use crate::error::FetchError;
use async_trait::async_trait;
use livecore::{CachedValue, QueryKey};
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

type FetchWaiter = oneshot::Sender<Result<CachedValue, FetchError>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Loads the value of a pull-backed key.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> Result<CachedValue, FetchError>;
}

pub struct QueryClient {
    cache: Arc<QueryCache>,
    fetcher: Arc<dyn Fetcher>,
    config: SyncConfig,
    in_flight: Mutex<HashMap<QueryKey, Vec<FetchWaiter>>>,
}

impl QueryClient {
    pub fn new(cache: Arc<QueryCache>, fetcher: Arc<dyn Fetcher>, config: SyncConfig) -> Self {
        Self {
            cache,
            fetcher,
            config,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached value for `key`, fetching it when it was never
    /// loaded or has been invalidated.
    pub async fn query(&self, key: QueryKey) -> Result<CachedValue, FetchError> {
        if key.is_live() {
            return Err(FetchError::NotFetchable(key));
        }

        self.cache.get_or_create(&key);
        if self.cache.is_fresh(&key) {
            if let Some(value) = self.cache.value(&key) {
                trace!(target: "Sync/Query", "Cache hit for '{key}'");
                return Ok(value);
            }
        }

        let waiter = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get_mut(&key) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    in_flight.insert(key, Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            debug!(target: "Sync/Query", "Joining in-flight fetch for '{key}'");
            return rx.await.unwrap_or(Err(FetchError::Cancelled));
        }

        // If this future is dropped, parked waiters see `Cancelled`.
        let guard = scopeguard::guard((), |_| {
            lock(&self.in_flight).remove(&key);
        });

        let generation = self.cache.generation(&key).unwrap_or(0);
        debug!(target: "Sync/Query", "Fetching '{key}'");
        let result = match self.fetcher.fetch(&key).await {
            Ok(value) => {
                if self.cache.store_fetched(&key, generation, value.clone()) {
                    self.expire_if_unused(&key);
                    Ok(value)
                } else {
                    Ok(self.cache.value(&key).unwrap_or(value))
                }
            }
            Err(e) => {
                debug!(target: "Sync/Query", "Fetch of '{key}' failed: {e}");
                Err(e)
            }
        };

        scopeguard::ScopeGuard::into_inner(guard);
        let waiters = lock(&self.in_flight).remove(&key).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }

    /// Starts the unused-data timer for a key nobody subscribes to.
    fn expire_if_unused(&self, key: &QueryKey) {
        if self.cache.consumer_count(key) > 0 {
            return;
        }
        let grace = self.config.grace_for(key.kind());
        if grace.is_zero() {
            self.cache.evict(key);
            return;
        }
        let cache = Arc::downgrade(&self.cache);
        let key = *key;
        self.cache.schedule_eviction(&key, grace, move |token| {
            if let Some(cache) = cache.upgrade() {
                cache.evict_if_pending(&key, token);
            }
        });
    }

    pub fn invalidate(&self, key: &QueryKey) -> bool {
        self.cache.invalidate(key)
    }

    pub fn invalidate_tag(&self, tag: &str) -> usize {
        self.cache.invalidate_tag(tag)
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }
}
