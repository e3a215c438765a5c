use crate::cache::QueryCache;
use crate::config::SyncConfig;
use crate::error::{ConnectionError, FetchError, SubscribeError};
use crate::handle::TransportHandle;
use crate::http::UreqHttpClient;
use crate::notifications::NotificationsApi;
use crate::query::QueryClient;
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::router::{
    DiagnosticSink, LogDiagnostics, LogNotifier, NotificationRouter, NotificationSink, Viewer,
};
use crate::socket::WebSocketTransportFactory;
use crate::stream::SsePushStreamFactory;
use livecore::key::USER_NOTIFICATIONS_TAG;
use livecore::net::{HttpClient, PushStreamFactory, TransportFactory};
use livecore::protocol::{CreateMessage, EditMessage, MessageRef, ReactToMessage, SendTyping};
use livecore::types::{GroupId, MessageId, UserId};
use livecore::{CachedValue, ClientEvent, QueryKey};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::task::JoinHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Entry point for callers: live subscriptions, pull queries, chat actions
/// and push notifications over one shared connection.
pub struct SyncClient {
    config: SyncConfig,
    handle: Arc<TransportHandle>,
    registry: SubscriptionRegistry,
    queries: Arc<QueryClient>,
    notifications: Arc<NotificationsApi>,
    router: Arc<NotificationRouter>,
    credential: RwLock<Option<String>>,
    router_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    pub fn builder() -> SyncClientBuilder {
        SyncClientBuilder::new()
    }

    /// Connects the shared transport. The credential is also used for the
    /// REST endpoints and the push stream.
    pub async fn connect(&self, credential: &str) -> Result<(), ConnectionError> {
        if credential.trim().is_empty() {
            return Err(ConnectionError::MissingCredential);
        }
        *self
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(credential.to_string());
        self.notifications.set_token(credential);
        self.handle.connect(credential).await
    }

    fn credential(&self) -> Option<String> {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribes a fresh consumer to `key`. Pull-backed keys are fetched in
    /// the background if their cached value is missing or invalidated.
    pub fn subscribe(&self, key: QueryKey) -> Result<Subscription, SubscribeError> {
        let consumer = self.registry.next_consumer_id();
        self.subscribe_as(key, consumer)
    }

    pub fn subscribe_as(
        &self,
        key: QueryKey,
        consumer: u64,
    ) -> Result<Subscription, SubscribeError> {
        let subscription = self.registry.acquire(key, consumer)?;
        if !key.is_live() && !self.registry.cache().is_fresh(&key) {
            self.spawn_fetch(key);
        }
        Ok(subscription)
    }

    fn spawn_fetch(&self, key: QueryKey) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(target: "Sync/Client", "No runtime to fetch '{key}'");
            return;
        };
        let queries = self.queries.clone();
        runtime.spawn(async move {
            if let Err(e) = queries.query(key).await {
                warn!(target: "Sync/Client", "Background fetch of '{key}' failed: {e}");
            }
        });
    }

    /// Reads a pull-backed key, from cache when fresh.
    pub async fn query(&self, key: QueryKey) -> Result<CachedValue, FetchError> {
        self.queries.query(key).await
    }

    pub fn invalidate(&self, key: &QueryKey) -> bool {
        self.queries.invalidate(key)
    }

    pub fn send_message(
        &self,
        group: GroupId,
        content: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        self.handle.emit(&ClientEvent::CreateMessage(CreateMessage {
            content: content.into(),
            group_id: group,
            replied_to: None,
        }))
    }

    pub fn reply_to_message(
        &self,
        group: GroupId,
        replied_to: MessageId,
        content: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        self.handle.emit(&ClientEvent::CreateMessage(CreateMessage {
            content: content.into(),
            group_id: group,
            replied_to: Some(replied_to),
        }))
    }

    pub fn send_typing(&self, group: GroupId, is_typing: bool) -> Result<(), ConnectionError> {
        self.handle.emit(&ClientEvent::Typing(SendTyping {
            is_typing,
            group_id: group,
        }))
    }

    pub fn delete_message(&self, message: MessageId) -> Result<(), ConnectionError> {
        self.handle.emit(&ClientEvent::DeleteMessage(MessageRef {
            message_id: message,
        }))
    }

    pub fn edit_message(
        &self,
        message: MessageId,
        content: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        self.handle.emit(&ClientEvent::EditMessage(EditMessage {
            message_id: message,
            content: content.into(),
        }))
    }

    pub fn react_to_message(
        &self,
        message: MessageId,
        reaction: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        self.handle.emit(&ClientEvent::ReactToMessage(ReactToMessage {
            message_id: message,
            reaction: reaction.into(),
        }))
    }

    /// Opens the push stream for `viewer` and routes it in the background.
    /// Calling it while the stream is running only updates the viewer; once
    /// the server has ended the stream it opens a new one.
    pub async fn start_notifications(&self, viewer: Viewer) -> Result<(), ConnectionError> {
        self.router.set_viewer(viewer);
        let token = self.credential().ok_or(ConnectionError::MissingCredential)?;

        let (stream, events) = match self.handle.open_stream(&self.config.sse_url, &token).await {
            Ok(opened) => opened,
            Err(ConnectionError::StreamAlreadyOpen) => {
                debug!(target: "Sync/Client", "Push stream already running");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let router = self.router.clone();
        let task = tokio::spawn(async move {
            router.run(events).await;
            // The server ended the stream; a later start must open a new one.
            stream.close();
        });
        if let Some(previous) = lock(&self.router_task).replace(task) {
            previous.abort();
        }
        info!(target: "Sync/Client", "Push notifications started");
        Ok(())
    }

    pub fn stop_notifications(&self) {
        self.handle.close_stream();
        if let Some(task) = lock(&self.router_task).take() {
            task.abort();
        }
    }

    /// Marks notifications read and invalidates the cached pages.
    pub async fn read_notifications(&self, ids: &[i64]) -> Result<(), FetchError> {
        self.notifications.read_notifications(ids).await?;
        self.queries.invalidate_tag(USER_NOTIFICATIONS_TAG);
        Ok(())
    }

    /// Stops notifications and closes the transport. Subscriptions still
    /// held are released normally; their teardown is logged and ignored.
    pub async fn shutdown(&self) {
        self.stop_notifications();
        self.handle.close().await;
        info!(target: "Sync/Client", "Client shut down");
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn handle(&self) -> &Arc<TransportHandle> {
        &self.handle
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        self.registry.cache()
    }

    pub fn router(&self) -> &Arc<NotificationRouter> {
        &self.router
    }
}

pub struct SyncClientBuilder {
    config: SyncConfig,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    stream_factory: Option<Arc<dyn PushStreamFactory>>,
    http_client: Option<Arc<dyn HttpClient>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
}

impl SyncClientBuilder {
    fn new() -> Self {
        Self {
            config: SyncConfig::default(),
            transport_factory: None,
            stream_factory: None,
            http_client: None,
            notifier: None,
            diagnostics: None,
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    pub fn with_stream_factory(mut self, factory: Arc<dyn PushStreamFactory>) -> Self {
        self.stream_factory = Some(factory);
        self
    }

    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Assembles the client. Anything not injected falls back to the
    /// WebSocket, SSE and `ureq` implementations and to log-only sinks.
    pub fn build(self) -> SyncClient {
        let config = self.config;
        let transport_factory = self.transport_factory.unwrap_or_else(|| {
            Arc::new(
                WebSocketTransportFactory::new(config.socket_url.clone())
                    .with_capacity(config.channel_capacity),
            )
        });
        let stream_factory = self
            .stream_factory
            .unwrap_or_else(|| Arc::new(SsePushStreamFactory::new(config.channel_capacity)));
        let http_client = self
            .http_client
            .unwrap_or_else(|| Arc::new(UreqHttpClient::new()));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));
        let diagnostics = self.diagnostics.unwrap_or_else(|| Arc::new(LogDiagnostics));

        let handle = TransportHandle::new(transport_factory, stream_factory);
        let cache = Arc::new(QueryCache::new());
        let registry = SubscriptionRegistry::new(handle.clone(), cache.clone(), config.clone());
        let notifications = Arc::new(NotificationsApi::new(http_client, config.api_url.clone()));
        let queries = Arc::new(QueryClient::new(cache, notifications.clone(), config.clone()));
        let router = Arc::new(NotificationRouter::new(
            Viewer::new(UserId(0), []),
            notifier,
            diagnostics,
        ));

        SyncClient {
            config,
            handle,
            registry,
            queries,
            notifications,
            router,
            credential: RwLock::new(None),
            router_task: Mutex::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockPushStreamFactory, MockTransportFactory};

    fn client(factory: &MockTransportFactory) -> SyncClient {
        SyncClient::builder()
            .with_transport_factory(Arc::new(factory.clone()))
            .with_stream_factory(Arc::new(MockPushStreamFactory::new()))
            .build()
    }

    #[tokio::test]
    async fn actions_use_the_wire_names() {
        let factory = MockTransportFactory::new();
        let client = client(&factory);
        client.connect("token").await.unwrap();

        client.send_message(GroupId(5), "hello").unwrap();
        client.send_typing(GroupId(5), true).unwrap();
        client.edit_message(MessageId(1), "edited").unwrap();
        client.react_to_message(MessageId(1), "👍").unwrap();
        client.delete_message(MessageId(1)).unwrap();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let sent = factory.sent_events();
        let names: Vec<&str> = sent.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            ["createMessage", "typing", "editMessage", "reactToMessage", "deleteMessage"]
        );
        assert_eq!(sent[0].1["Content"], "hello");
        assert_eq!(sent[0].1["GroupID"], 5);
        assert_eq!(sent[1].1["IsTyping"], true);
    }

    #[tokio::test]
    async fn notifications_need_a_credential() {
        let factory = MockTransportFactory::new();
        let client = client(&factory);
        let err = client
            .start_notifications(Viewer::new(UserId(1), []))
            .await
            .unwrap_err();
        assert_eq!(err, ConnectionError::MissingCredential);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let factory = MockTransportFactory::new();
        let client = client(&factory);
        client.connect("token").await.unwrap();
        client
            .start_notifications(Viewer::new(UserId(1), []))
            .await
            .unwrap();
        client
            .start_notifications(Viewer::new(UserId(1), [GroupId(2)]))
            .await
            .unwrap();
        assert!(client.handle().is_stream_open());
        assert!(client.router().viewer().groups_joined.contains(&GroupId(2)));

        client.shutdown().await;
        assert!(!client.handle().is_stream_open());
        assert_eq!(
            client.send_message(GroupId(1), "late"),
            Err(ConnectionError::Closed)
        );
    }
}
