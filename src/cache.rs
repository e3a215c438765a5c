//! Per-key cache entries: value, consumers, generation and the pending
//! eviction timer.

use dashmap::DashMap;
use livecore::{CachedValue, QueryKey};
use log::{debug, trace};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;

struct PendingEviction {
    token: u64,
    task: AbortHandle,
}

struct CacheEntry {
    value: watch::Sender<CachedValue>,
    consumers: HashSet<u64>,
    pending_eviction: Option<PendingEviction>,
    generation: u64,
    invalidated: bool,
    loaded: bool,
}

impl CacheEntry {
    fn new(key: &QueryKey) -> Self {
        let (value, _) = watch::channel(CachedValue::empty_for(key));
        Self {
            value,
            consumers: HashSet::new(),
            pending_eviction: None,
            generation: 0,
            invalidated: false,
            loaded: false,
        }
    }

    fn cancel_eviction(&mut self) -> bool {
        match self.pending_eviction.take() {
            Some(pending) => {
                pending.task.abort();
                true
            }
            None => false,
        }
    }
}

/// Cache of live and fetched values keyed by [`QueryKey`].
#[derive(Default)]
pub struct QueryCache {
    entries: DashMap<QueryKey, CacheEntry>,
    next_token: AtomicU64,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a watcher on the entry for `key`, creating it if needed.
    pub fn get_or_create(&self, key: &QueryKey) -> watch::Receiver<CachedValue> {
        self.entries
            .entry(*key)
            .or_insert_with(|| CacheEntry::new(key))
            .value
            .subscribe()
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn value(&self, key: &QueryKey) -> Option<CachedValue> {
        self.entries.get(key).map(|e| e.value.borrow().clone())
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies `mutator` to the current value and notifies watchers if it
    /// reports a change. Returns false when the key has no entry.
    pub fn update<F>(&self, key: &QueryKey, mutator: F) -> bool
    where
        F: FnOnce(&mut CachedValue) -> bool,
    {
        let Some(mut entry) = self.entries.get_mut(key) else {
            trace!(target: "Sync/Cache", "Update for evicted '{key}' ignored");
            return false;
        };
        entry.generation += 1;
        entry.loaded = true;
        entry.value.send_if_modified(mutator)
    }

    /// Like [`update`](Self::update), but only when no other update or
    /// invalidation happened since `generation` was read.
    pub fn update_if_current<F>(&self, key: &QueryKey, generation: u64, mutator: F) -> bool
    where
        F: FnOnce(&mut CachedValue) -> bool,
    {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.generation != generation {
            debug!(
                target: "Sync/Cache",
                "Dropping stale update for '{key}' (generation {generation}, now {})",
                entry.generation
            );
            return false;
        }
        entry.generation += 1;
        entry.loaded = true;
        entry.value.send_if_modified(mutator)
    }

    /// Stores a fetched value taken at `generation` and marks the entry
    /// fresh. A stale value is dropped.
    pub fn store_fetched(&self, key: &QueryKey, generation: u64, value: CachedValue) -> bool {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.generation != generation {
            debug!(target: "Sync/Cache", "Dropping stale fetch result for '{key}'");
            return false;
        }
        entry.generation += 1;
        entry.loaded = true;
        entry.invalidated = false;
        entry.value.send_replace(value);
        true
    }

    pub fn generation(&self, key: &QueryKey) -> Option<u64> {
        self.entries.get(key).map(|e| e.generation)
    }

    /// Loaded and not invalidated since.
    pub fn is_fresh(&self, key: &QueryKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.loaded && !e.invalidated)
    }

    /// Forces a refetch on next access and voids fetches already in flight.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.invalidated = true;
                entry.generation += 1;
                true
            }
            None => false,
        }
    }

    /// Invalidates every entry whose key provides `tag`. Returns the count.
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        let mut count = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.key().provides(tag) {
                entry.invalidated = true;
                entry.generation += 1;
                count += 1;
            }
        }
        debug!(target: "Sync/Cache", "Invalidated {count} entries tagged '{tag}'");
        count
    }

    /// Adds a consumer, creating the entry and cancelling any pending
    /// eviction. Returns false if the consumer was already attached.
    pub fn attach(&self, key: &QueryKey, consumer: u64) -> bool {
        let mut entry = self
            .entries
            .entry(*key)
            .or_insert_with(|| CacheEntry::new(key));
        if entry.cancel_eviction() {
            debug!(target: "Sync/Cache", "Re-acquired '{key}' inside grace window, eviction cancelled");
        }
        entry.consumers.insert(consumer)
    }

    /// Removes a consumer. Returns the remaining count, or `None` if the key
    /// has no entry.
    pub fn detach(&self, key: &QueryKey, consumer: u64) -> Option<usize> {
        let mut entry = self.entries.get_mut(key)?;
        entry.consumers.remove(&consumer);
        Some(entry.consumers.len())
    }

    pub fn consumer_count(&self, key: &QueryKey) -> usize {
        self.entries.get(key).map_or(0, |e| e.consumers.len())
    }

    pub fn has_pending_eviction(&self, key: &QueryKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.pending_eviction.is_some())
    }

    /// Arms the eviction timer for an unused entry. After `delay`,
    /// `on_fire` is called with the timer's token, which the callback hands
    /// to [`evict_if_pending`](Self::evict_if_pending). Returns false if the
    /// entry is missing or in use, or if there is no runtime to run the
    /// timer on.
    pub fn schedule_eviction<F>(&self, key: &QueryKey, delay: Duration, on_fire: F) -> bool
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(target: "Sync/Cache", "No runtime to schedule eviction of '{key}'");
            return false;
        };
        let Some(mut entry) = self.entries.get_mut(key) else {
            return false;
        };
        if !entry.consumers.is_empty() {
            return false;
        }

        entry.cancel_eviction();
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(token);
        });
        entry.pending_eviction = Some(PendingEviction {
            token,
            task: task.abort_handle(),
        });
        trace!(target: "Sync/Cache", "Eviction of '{key}' scheduled in {delay:?}");
        true
    }

    pub fn cancel_eviction(&self, key: &QueryKey) -> bool {
        self.entries
            .get_mut(key)
            .is_some_and(|mut e| e.cancel_eviction())
    }

    /// Evicts the entry if the timer identified by `token` is still the
    /// pending one and nobody re-attached.
    pub fn evict_if_pending(&self, key: &QueryKey, token: u64) -> bool {
        self.entries
            .remove_if(key, |_, e| {
                e.consumers.is_empty()
                    && e.pending_eviction.as_ref().is_some_and(|p| p.token == token)
            })
            .is_some()
    }

    /// Evicts an entry that has no consumers.
    pub fn evict(&self, key: &QueryKey) -> bool {
        match self.entries.remove_if(key, |_, e| e.consumers.is_empty()) {
            Some((_, mut entry)) => {
                entry.cancel_eviction();
                debug!(target: "Sync/Cache", "Evicted '{key}'");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecore::types::{GroupId, SerializedMessage};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    const KEY: QueryKey = QueryKey::GroupMessages(GroupId(5));

    fn message(id: i64) -> SerializedMessage {
        serde_json::from_value(json!({ "MessageID": id, "Content": "" })).unwrap()
    }

    fn push(value: &mut CachedValue, id: i64) -> bool {
        match value {
            CachedValue::Messages(list) => {
                list.push(message(id));
                true
            }
            _ => false,
        }
    }

    #[test]
    fn update_on_missing_key_is_a_no_op() {
        let cache = QueryCache::new();
        assert!(!cache.update(&KEY, |v| push(v, 1)));
        assert!(!cache.contains(&KEY));
    }

    #[test]
    fn updates_notify_watchers_and_bump_generation() {
        let cache = QueryCache::new();
        let mut rx = cache.get_or_create(&KEY);
        assert_eq!(cache.generation(&KEY), Some(0));

        assert!(cache.update(&KEY, |v| push(v, 1)));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_messages().unwrap().len(), 1);
        assert_eq!(cache.generation(&KEY), Some(1));
    }

    #[test]
    fn stale_generation_is_dropped() {
        let cache = QueryCache::new();
        cache.get_or_create(&KEY);
        let seen = cache.generation(&KEY).unwrap();

        cache.update(&KEY, |v| push(v, 1));
        assert!(!cache.update_if_current(&KEY, seen, |v| push(v, 2)));
        assert!(!cache.store_fetched(&KEY, seen, CachedValue::Messages(Vec::new())));
        assert_eq!(cache.value(&KEY).unwrap().as_messages().unwrap().len(), 1);
    }

    #[test]
    fn invalidation_voids_in_flight_results() {
        let cache = QueryCache::new();
        let key = QueryKey::UserNotifications { limit: 10, offset: 0 };
        cache.get_or_create(&key);
        let started = cache.generation(&key).unwrap();
        assert!(cache.store_fetched(&key, started, CachedValue::empty_for(&key)));
        assert!(cache.is_fresh(&key));

        let refetch = cache.generation(&key).unwrap();
        assert_eq!(cache.invalidate_tag(livecore::key::USER_NOTIFICATIONS_TAG), 1);
        assert!(!cache.is_fresh(&key));
        assert!(!cache.store_fetched(&key, refetch, CachedValue::empty_for(&key)));
    }

    #[test]
    fn evict_refuses_entries_in_use() {
        let cache = QueryCache::new();
        assert!(cache.attach(&KEY, 1));
        assert!(!cache.attach(&KEY, 1));
        assert!(!cache.evict(&KEY));
        assert_eq!(cache.detach(&KEY, 1), Some(0));
        assert!(cache.evict(&KEY));
        assert!(!cache.contains(&KEY));
    }

    #[test]
    fn scheduling_without_runtime_fails() {
        let cache = QueryCache::new();
        cache.get_or_create(&KEY);
        assert!(!cache.schedule_eviction(&KEY, Duration::from_secs(1), |_| {}));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_delay_and_attach_cancels_it() {
        let cache = Arc::new(QueryCache::new());
        let fired = Arc::new(AtomicUsize::new(0));

        cache.attach(&KEY, 1);
        cache.detach(&KEY, 1);
        let (c, f) = (cache.clone(), fired.clone());
        assert!(cache.schedule_eviction(&KEY, Duration::from_secs(1), move |token| {
            f.fetch_add(1, Ordering::SeqCst);
            c.evict_if_pending(&KEY, token);
        }));
        assert!(cache.has_pending_eviction(&KEY));

        tokio::time::sleep(Duration::from_millis(500)).await;
        cache.attach(&KEY, 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(cache.contains(&KEY));

        cache.detach(&KEY, 2);
        let (c, f) = (cache.clone(), fired.clone());
        cache.schedule_eviction(&KEY, Duration::from_secs(1), move |token| {
            f.fetch_add(1, Ordering::SeqCst);
            c.evict_if_pending(&KEY, token);
        });
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!cache.contains(&KEY));
    }

    #[test]
    fn stale_token_does_not_evict() {
        let cache = QueryCache::new();
        cache.get_or_create(&KEY);
        assert!(!cache.evict_if_pending(&KEY, 42));
        assert!(cache.contains(&KEY));
    }
}
