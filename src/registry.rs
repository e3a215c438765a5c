//! Reference-counted subscriptions over the shared transport.
//!
//! The first consumer of a live key attaches the server listeners and joins
//! the server room; the last one to leave arms the grace timer, and the
//! room is left only if nobody came back before it fired. Each server event
//! name has a single handler on the transport no matter how many keys need
//! it; decoded events are routed to keys here.
//!
//! Server rooms belong to one connection. Joins are sent on the connection
//! the registry has synced with, and replayed for every live key whenever
//! the handle connects again.

use crate::cache::QueryCache;
use crate::config::SyncConfig;
use crate::error::{SubscribeError, TeardownError};
use crate::handle::{EventHandler, TransportHandle};
use livecore::types::GroupId;
use livecore::types::events::names;
use livecore::{CachedValue, ClientEvent, PushEvent, QueryKey};
use log::{debug, info, trace, warn};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Server events a live key listens to.
fn listeners_for(key: &QueryKey) -> &'static [&'static str] {
    match key {
        QueryKey::GroupMessages(_) => &[
            names::ALL_MESSAGES,
            names::NEW_MESSAGE,
            names::EDITED_MESSAGE,
            names::DELETED_MESSAGE,
        ],
        QueryKey::TypingUsers => &[names::IS_TYPING],
        QueryKey::MessageInfo(_) => &[names::MESSAGE_INFO, names::NEW_MESSAGE_READ_INFO],
        QueryKey::UserNotifications { .. } | QueryKey::MessageNotifications => &[],
    }
}

fn join_event(key: &QueryKey) -> Option<ClientEvent> {
    match key {
        QueryKey::GroupMessages(group) => Some(ClientEvent::join_room(*group)),
        QueryKey::MessageInfo(message) => Some(ClientEvent::get_message_info(*message)),
        _ => None,
    }
}

fn leave_event(key: &QueryKey) -> Option<ClientEvent> {
    match key {
        QueryKey::GroupMessages(group) => Some(ClientEvent::leave_room(*group)),
        QueryKey::MessageInfo(message) => Some(ClientEvent::leave_message_info_room(*message)),
        _ => None,
    }
}

#[derive(Default)]
struct RegistryState {
    /// Keys whose transport setup has run and not been torn down.
    live: HashSet<QueryKey>,
    listener_refs: HashMap<&'static str, usize>,
    /// Joined groups whose `allMessages` snapshot has not arrived yet,
    /// oldest first.
    awaiting_snapshot: VecDeque<GroupId>,
    /// Connection epoch whose rooms match `live`.
    synced_epoch: u64,
}

struct RegistryInner {
    handle: Arc<TransportHandle>,
    cache: Arc<QueryCache>,
    config: SyncConfig,
    state: Mutex<RegistryState>,
    next_consumer: AtomicU64,
}

impl RegistryInner {
    fn setup(self: &Arc<Self>, state: &mut RegistryState, key: &QueryKey) {
        for event in listeners_for(key) {
            self.retain_listener(state, event);
        }
        if self.handle.connected_epoch() == Some(state.synced_epoch) {
            self.join(state, key);
        } else {
            debug!(target: "Sync/Registry", "Not connected, joining '{key}' on connect");
        }
        info!(target: "Sync/Registry", "Subscribed to '{key}'");
    }

    fn join(&self, state: &mut RegistryState, key: &QueryKey) {
        if let QueryKey::GroupMessages(group) = key {
            if !state.awaiting_snapshot.contains(group) {
                state.awaiting_snapshot.push_back(*group);
            }
        }
        if let Some(join) = join_event(key) {
            if let Err(e) = self.handle.emit(&join) {
                warn!(target: "Sync/Registry", "Could not send '{}' for '{key}': {e}", join.name());
            }
        }
    }

    /// Rejoins every live key on a new connection.
    fn resync(&self, epoch: u64) {
        let mut state = lock(&self.state);
        if state.synced_epoch == epoch {
            return;
        }
        state.synced_epoch = epoch;
        state.awaiting_snapshot.clear();

        let mut keys: Vec<QueryKey> = state.live.iter().copied().collect();
        keys.sort();
        if !keys.is_empty() {
            info!(target: "Sync/Registry", "Rejoining {} key(s) on connection {epoch}", keys.len());
        }
        for key in &keys {
            self.join(&mut state, key);
        }
    }

    fn retain_listener(self: &Arc<Self>, state: &mut RegistryState, event: &'static str) {
        let refs = state.listener_refs.entry(event).or_insert(0);
        *refs += 1;
        if *refs == 1 {
            let weak = Arc::downgrade(self);
            let handler: EventHandler = Arc::new(move |payload: Value| {
                if let Some(inner) = weak.upgrade() {
                    inner.route(event, payload);
                }
            });
            self.handle.on(event, handler);
            trace!(target: "Sync/Registry", "Attached listener for '{event}'");
        }
    }

    fn release_listener(&self, state: &mut RegistryState, event: &'static str) {
        let Some(refs) = state.listener_refs.get_mut(event) else {
            return;
        };
        *refs -= 1;
        if *refs == 0 {
            state.listener_refs.remove(event);
            self.handle.off(event);
            trace!(target: "Sync/Registry", "Detached listener for '{event}'");
        }
    }

    fn teardown(&self, state: &mut RegistryState, key: &QueryKey) -> Result<(), TeardownError> {
        if !state.live.remove(key) {
            return Ok(());
        }
        if let QueryKey::GroupMessages(group) = key {
            state.awaiting_snapshot.retain(|g| g != group);
        }
        for event in listeners_for(key) {
            self.release_listener(state, event);
        }
        info!(target: "Sync/Registry", "Unsubscribed from '{key}'");
        match leave_event(key) {
            Some(leave) => self
                .handle
                .emit(&leave)
                .map_err(|source| TeardownError { key: *key, source }),
            None => Ok(()),
        }
    }

    /// Evicts an unused key and tears its setup down. Failures are logged.
    fn finish(&self, state: &mut RegistryState, key: &QueryKey) {
        if self.cache.evict(key) {
            if let Err(e) = self.teardown(state, key) {
                warn!(target: "Sync/Registry", "{e}");
            }
        }
    }

    fn release(self: &Arc<Self>, key: QueryKey, consumer: u64) {
        let mut state = lock(&self.state);
        let Some(remaining) = self.cache.detach(&key, consumer) else {
            return;
        };
        if remaining > 0 {
            return;
        }

        let grace = self.config.grace_for(key.kind());
        if grace.is_zero() {
            self.finish(&mut state, &key);
            return;
        }

        let weak = Arc::downgrade(self);
        let scheduled = self.cache.schedule_eviction(&key, grace, move |token| {
            if let Some(inner) = weak.upgrade() {
                inner.grace_elapsed(key, token);
            }
        });
        if scheduled {
            debug!(target: "Sync/Registry", "Last consumer of '{key}' left, teardown in {grace:?}");
        } else {
            self.finish(&mut state, &key);
        }
    }

    fn grace_elapsed(&self, key: QueryKey, token: u64) {
        let mut state = lock(&self.state);
        if self.cache.evict_if_pending(&key, token) {
            debug!(target: "Sync/Registry", "Grace window for '{key}' elapsed");
            if let Err(e) = self.teardown(&mut state, &key) {
                warn!(target: "Sync/Registry", "{e}");
            }
        }
    }

    fn route(&self, name: &str, payload: Value) {
        let event = match PushEvent::decode(name, payload) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(target: "Sync/Registry", "No push event named '{name}'");
                return;
            }
            Err(e) => {
                warn!(target: "Sync/Registry", "Dropping malformed event: {e}");
                return;
            }
        };

        let mut state = lock(&self.state);
        let targets = targets_for(&mut state, &event);
        if targets.is_empty() {
            debug!(target: "Sync/Registry", "No subscribed key for '{name}'");
        }
        for key in targets {
            self.cache.update(&key, |value| value.apply_event(&event));
        }
    }
}

fn live_keys_where(state: &RegistryState, pred: impl Fn(&QueryKey) -> bool) -> Vec<QueryKey> {
    state.live.iter().copied().filter(|k| pred(k)).collect()
}

fn group_target(state: &RegistryState, group: Option<GroupId>) -> Vec<QueryKey> {
    match group {
        Some(group) => {
            let key = QueryKey::GroupMessages(group);
            if state.live.contains(&key) {
                vec![key]
            } else {
                Vec::new()
            }
        }
        None => live_keys_where(state, |k| matches!(k, QueryKey::GroupMessages(_))),
    }
}

/// Keys an event applies to.
fn targets_for(state: &mut RegistryState, event: &PushEvent) -> Vec<QueryKey> {
    match event {
        PushEvent::AllMessages(snapshot) => {
            let group = match snapshot.first().and_then(|m| m.group_id) {
                Some(group) => {
                    state.awaiting_snapshot.retain(|g| *g != group);
                    Some(group)
                }
                None => state.awaiting_snapshot.pop_front(),
            };
            match group {
                Some(group) => group_target(state, Some(group)),
                None => Vec::new(),
            }
        }
        PushEvent::NewMessage(message) | PushEvent::EditedMessage(message) => {
            group_target(state, message.group_id)
        }
        PushEvent::DeletedMessage(deleted) => group_target(state, deleted.group_id),
        PushEvent::Typing(_) => live_keys_where(state, |k| *k == QueryKey::TypingUsers),
        PushEvent::MessageInfo(_) | PushEvent::NewMessageReadInfo(_) => {
            live_keys_where(state, |k| matches!(k, QueryKey::MessageInfo(_)))
        }
    }
}

/// Owns transport setup for every subscribed key. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(handle: Arc<TransportHandle>, cache: Arc<QueryCache>, config: SyncConfig) -> Self {
        let state = RegistryState {
            synced_epoch: handle.connected_epoch().unwrap_or(0),
            ..RegistryState::default()
        };
        let inner = Arc::new(RegistryInner {
            handle,
            cache,
            config,
            state: Mutex::new(state),
            next_consumer: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&inner);
        inner.handle.on_connected(Arc::new(move |epoch: u64| {
            if let Some(inner) = weak.upgrade() {
                inner.resync(epoch);
            }
        }));
        Self { inner }
    }

    /// A consumer id not handed out before by this registry.
    pub fn next_consumer_id(&self) -> u64 {
        self.inner.next_consumer.fetch_add(1, Ordering::SeqCst)
    }

    /// Claims `key` for `consumer`. The first claim on a live key attaches
    /// its listeners and joins the server room; later claims share them.
    pub fn acquire(&self, key: QueryKey, consumer: u64) -> Result<Subscription, SubscribeError> {
        let inner = &self.inner;
        let mut state = lock(&inner.state);
        if !inner.cache.attach(&key, consumer) {
            return Err(SubscribeError::AlreadySubscribed { key, consumer });
        }
        let receiver = inner.cache.get_or_create(&key);
        if key.is_live() && state.live.insert(key) {
            inner.setup(&mut state, &key);
        }
        trace!(
            target: "Sync/Registry",
            "Consumer {consumer} acquired '{key}' ({} total)",
            inner.cache.consumer_count(&key)
        );
        Ok(Subscription {
            key,
            consumer,
            receiver,
            registry: Arc::downgrade(inner),
            released: false,
        })
    }

    pub fn release(&self, subscription: Subscription) {
        subscription.release();
    }

    /// Keys with at least one consumer.
    pub fn active_keys(&self) -> Vec<QueryKey> {
        self.inner
            .cache
            .keys()
            .into_iter()
            .filter(|k| self.inner.cache.consumer_count(k) > 0)
            .collect()
    }

    /// Whether the transport setup for `key` is in place.
    pub fn is_set_up(&self, key: &QueryKey) -> bool {
        lock(&self.inner.state).live.contains(key)
    }

    pub fn consumer_count(&self, key: &QueryKey) -> usize {
        self.inner.cache.consumer_count(key)
    }

    /// How many live keys share the handler for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.inner.state)
            .listener_refs
            .get(event)
            .copied()
            .unwrap_or(0)
    }

    pub fn handle(&self) -> &Arc<TransportHandle> {
        &self.inner.handle
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.inner.cache
    }
}

/// One consumer's claim on a key. Released explicitly or when dropped.
pub struct Subscription {
    key: QueryKey,
    consumer: u64,
    receiver: watch::Receiver<CachedValue>,
    registry: Weak<RegistryInner>,
    released: bool,
}

impl Subscription {
    pub fn key(&self) -> QueryKey {
        self.key
    }

    pub fn consumer(&self) -> u64 {
        self.consumer
    }

    pub fn current(&self) -> CachedValue {
        self.receiver.borrow().clone()
    }

    /// Waits for the next change. Returns `None` once the entry is gone.
    pub async fn changed(&mut self) -> Option<CachedValue> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    pub fn receiver(&self) -> watch::Receiver<CachedValue> {
        self.receiver.clone()
    }

    pub fn release(mut self) {
        self.release_claim();
    }

    fn release_claim(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(inner) = self.registry.upgrade() {
            inner.release(self.key, self.consumer);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_claim();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("consumer", &self.consumer)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockPushStreamFactory, MockTransportFactory};
    use livecore::types::MessageId;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        factory: MockTransportFactory,
        registry: SubscriptionRegistry,
    }

    async fn fixture(config: SyncConfig) -> Fixture {
        let factory = MockTransportFactory::new();
        let handle = TransportHandle::new(
            Arc::new(factory.clone()),
            Arc::new(MockPushStreamFactory::new()),
        );
        handle.connect("token").await.unwrap();
        let registry = SubscriptionRegistry::new(handle, Arc::new(QueryCache::new()), config);
        Fixture { factory, registry }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    const GROUP: QueryKey = QueryKey::GroupMessages(GroupId(5));

    #[tokio::test]
    async fn shared_setup_for_two_consumers() {
        let f = fixture(SyncConfig::default()).await;
        let a = f.registry.acquire(GROUP, 1).unwrap();
        let b = f.registry.acquire(GROUP, 2).unwrap();
        settle().await;

        assert_eq!(f.factory.count_sent("joinRoom"), 1);
        assert_eq!(f.registry.listener_count("newMessage"), 1);
        assert_eq!(f.registry.handle().registration_count(), 4);
        assert_eq!(f.registry.consumer_count(&GROUP), 2);
        drop((a, b));
    }

    #[tokio::test]
    async fn same_consumer_cannot_claim_twice() {
        let f = fixture(SyncConfig::default()).await;
        let _a = f.registry.acquire(GROUP, 1).unwrap();
        assert_eq!(
            f.registry.acquire(GROUP, 1).unwrap_err(),
            SubscribeError::AlreadySubscribed {
                key: GROUP,
                consumer: 1
            }
        );
        assert_eq!(f.registry.consumer_count(&GROUP), 1);
    }

    #[tokio::test]
    async fn groups_share_one_handler_per_event() {
        let f = fixture(SyncConfig::default().with_grace_window(Duration::ZERO)).await;
        let a = f.registry.acquire(GROUP, 1).unwrap();
        let b = f
            .registry
            .acquire(QueryKey::GroupMessages(GroupId(6)), 1)
            .unwrap();
        assert_eq!(f.registry.listener_count("allMessages"), 2);
        assert_eq!(f.registry.handle().registration_count(), 4);

        a.release();
        assert!(f.registry.handle().has_handler("allMessages"));
        b.release();
        assert!(!f.registry.handle().has_handler("allMessages"));
        assert_eq!(f.registry.listener_count("allMessages"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_window_defers_teardown() {
        let f = fixture(SyncConfig::default()).await;
        let sub = f.registry.acquire(GROUP, 1).unwrap();
        f.factory
            .push("allMessages", json!([{"MessageID": 1, "GroupID": 5}]))
            .await;
        settle().await;

        sub.release();
        assert!(f.registry.cache().contains(&GROUP));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(f.registry.is_set_up(&GROUP));

        let again = f.registry.acquire(GROUP, 2).unwrap();
        assert_eq!(again.current().as_messages().unwrap().len(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(f.registry.is_set_up(&GROUP));
        assert_eq!(f.factory.count_sent("joinRoom"), 1);

        drop(again);
        tokio::time::sleep(Duration::from_millis(1001)).await;
        settle().await;
        assert!(!f.registry.cache().contains(&GROUP));
        assert!(!f.registry.is_set_up(&GROUP));
        assert_eq!(f.factory.count_sent("leaveRoom"), 1);
    }

    #[tokio::test]
    async fn zero_grace_tears_message_info_down_at_once() {
        let f = fixture(SyncConfig::default()).await;
        let key = QueryKey::MessageInfo(MessageId(9));
        let sub = f.registry.acquire(key, 1).unwrap();
        sub.release();
        settle().await;

        assert!(!f.registry.cache().contains(&key));
        assert_eq!(f.factory.count_sent("getMessageInfo"), 1);
        assert_eq!(f.factory.count_sent("leaveMessageInfoRoom"), 1);
        assert!(!f.registry.handle().has_handler("messageInfo"));
    }

    #[tokio::test]
    async fn messages_without_group_fan_out() {
        let f = fixture(SyncConfig::default()).await;
        let a = f.registry.acquire(GROUP, 1).unwrap();
        let other = QueryKey::GroupMessages(GroupId(6));
        let b = f.registry.acquire(other, 1).unwrap();

        f.factory
            .push("newMessage", json!({"MessageID": 1, "Content": "hi"}))
            .await;
        f.factory
            .push("newMessage", json!({"MessageID": 2, "GroupID": 6}))
            .await;
        settle().await;

        assert_eq!(a.current().as_messages().unwrap().len(), 1);
        assert_eq!(b.current().as_messages().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_snapshot_goes_to_oldest_waiting_group() {
        let f = fixture(SyncConfig::default()).await;
        let a = f.registry.acquire(GROUP, 1).unwrap();
        let b = f
            .registry
            .acquire(QueryKey::GroupMessages(GroupId(6)), 1)
            .unwrap();

        f.factory
            .push("newMessage", json!({"MessageID": 1, "GroupID": 5}))
            .await;
        f.factory.push("allMessages", json!([])).await;
        f.factory
            .push("newMessage", json!({"MessageID": 2, "GroupID": 6}))
            .await;
        settle().await;

        assert!(a.current().as_messages().unwrap().is_empty());
        assert_eq!(b.current().as_messages().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_leaves_value_untouched() {
        let f = fixture(SyncConfig::default()).await;
        let sub = f.registry.acquire(GROUP, 1).unwrap();
        f.factory
            .push("newMessage", json!({"MessageID": 1, "GroupID": 5}))
            .await;
        f.factory
            .push("editedMessage", json!({"Content": "no id", "GroupID": 5}))
            .await;
        settle().await;

        let messages = sub.current();
        assert_eq!(messages.as_messages().unwrap().len(), 1);
        assert_eq!(messages.as_messages().unwrap()[0].content, "");
    }

    #[tokio::test]
    async fn typing_routes_to_typing_key() {
        let f = fixture(SyncConfig::default()).await;
        let mut sub = f.registry.acquire(QueryKey::TypingUsers, 1).unwrap();
        f.factory
            .push("isTyping", json!({"Username": "ana", "IsTyping": true}))
            .await;

        let value = sub.changed().await.unwrap();
        assert_eq!(value.as_typing().unwrap(), ["ana".to_string()]);
        assert_eq!(f.factory.count_sent("joinRoom"), 0);
    }

    #[tokio::test]
    async fn reconnect_rejoins_and_waits_for_a_new_snapshot() {
        let f = fixture(SyncConfig::default()).await;
        let sub = f.registry.acquire(GROUP, 1).unwrap();
        let _typing = f.registry.acquire(QueryKey::TypingUsers, 1).unwrap();
        f.factory
            .push("allMessages", json!([{"MessageID": 1, "GroupID": 5}]))
            .await;
        settle().await;

        f.factory.drop_connection().await;
        settle().await;
        f.registry.handle().connect("token").await.unwrap();
        f.factory.push("allMessages", json!([])).await;
        settle().await;

        assert_eq!(f.factory.count_sent("joinRoom"), 2);
        assert!(sub.current().as_messages().unwrap().is_empty());
        assert_eq!(f.registry.handle().registration_count(), 5);
    }

    #[tokio::test]
    async fn teardown_on_closed_handle_is_swallowed() {
        let f = fixture(SyncConfig::default().with_grace_window(Duration::ZERO)).await;
        let sub = f.registry.acquire(GROUP, 1).unwrap();
        f.registry.handle().close().await;

        sub.release();
        assert!(!f.registry.is_set_up(&GROUP));
        assert!(!f.registry.cache().contains(&GROUP));
    }
}
