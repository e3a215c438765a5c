pub use crate::socket::WebSocketTransportFactory;
pub use crate::stream::SsePushStreamFactory;
pub use livecore::net::{PushStreamFactory, StreamCloser, Transport, TransportEvent, TransportFactory};

/// In-memory transport for tests: records every frame the client sends and
/// lets the test play the server side.
#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::*;
    use async_trait::async_trait;
    use livecore::framing;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A transport that stores outgoing frames instead of sending them.
    pub struct MockTransport {
        sent: Arc<Mutex<Vec<String>>>,
        closed: AtomicBool,
        events: mpsc::Sender<TransportEvent>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, frame: &str) -> Result<(), anyhow::Error> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("mock transport is closed"));
            }
            lock(&self.sent).push(frame.to_string());
            Ok(())
        }

        async fn disconnect(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                let _ = self.events.try_send(TransportEvent::Disconnected);
            }
        }
    }

    #[derive(Default)]
    struct MockState {
        created: AtomicUsize,
        fail_next: Mutex<Option<String>>,
        connect_delay: Mutex<Duration>,
        credentials: Mutex<Vec<String>>,
        sent: Arc<Mutex<Vec<String>>>,
        server: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    }

    /// Creates [`MockTransport`]s and keeps the server end of the latest one.
    #[derive(Default, Clone)]
    pub struct MockTransportFactory {
        state: Arc<MockState>,
    }

    impl MockTransportFactory {
        pub fn new() -> Self {
            Self::default()
        }

        /// Delays every connection attempt, to observe concurrent connects.
        pub fn with_connect_delay(self, delay: Duration) -> Self {
            *lock(&self.state.connect_delay) = delay;
            self
        }

        /// Makes the next `create_transport` call fail with `reason`.
        pub fn fail_next(&self, reason: impl Into<String>) {
            *lock(&self.state.fail_next) = Some(reason.into());
        }

        /// Number of transports created so far.
        pub fn created(&self) -> usize {
            self.state.created.load(Ordering::SeqCst)
        }

        pub fn credentials(&self) -> Vec<String> {
            lock(&self.state.credentials).clone()
        }

        pub fn sent_frames(&self) -> Vec<String> {
            lock(&self.state.sent).clone()
        }

        /// Sent frames decoded into `(event name, payload)`.
        pub fn sent_events(&self) -> Vec<(String, Value)> {
            self.sent_frames()
                .iter()
                .filter_map(|frame| framing::decode_frame(frame).ok())
                .collect()
        }

        pub fn count_sent(&self, event: &str) -> usize {
            self.sent_events()
                .iter()
                .filter(|(name, _)| name == event)
                .count()
        }

        /// Plays a server-emitted event. Returns false when no connection is live.
        pub async fn push(&self, event: &str, payload: Value) -> bool {
            self.push_raw(framing::encode_frame(event, &payload)).await
        }

        pub async fn push_raw(&self, frame: impl Into<String>) -> bool {
            let server = lock(&self.state.server).clone();
            match server {
                Some(tx) => tx
                    .send(TransportEvent::FrameReceived(frame.into()))
                    .await
                    .is_ok(),
                None => false,
            }
        }

        /// Simulates the server dropping the connection.
        pub async fn drop_connection(&self) {
            let server = lock(&self.state.server).take();
            if let Some(tx) = server {
                let _ = tx.send(TransportEvent::Disconnected).await;
            }
        }
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn create_transport(
            &self,
            credential: &str,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            let delay = *lock(&self.state.connect_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.state.created.fetch_add(1, Ordering::SeqCst);
            lock(&self.state.credentials).push(credential.to_string());

            if let Some(reason) = lock(&self.state.fail_next).take() {
                return Err(anyhow::anyhow!(reason));
            }

            let (tx, rx) = mpsc::channel(64);
            let _ = tx.try_send(TransportEvent::Connected);
            *lock(&self.state.server) = Some(tx.clone());

            let transport = MockTransport {
                sent: self.state.sent.clone(),
                closed: AtomicBool::new(false),
                events: tx,
            };
            Ok((Arc::new(transport), rx))
        }
    }

    struct MockCloser {
        closed: Arc<AtomicUsize>,
    }

    impl StreamCloser for MockCloser {
        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockStreamState {
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
        tokens: Mutex<Vec<String>>,
        server: Mutex<Option<mpsc::Sender<String>>>,
    }

    /// Push stream factory whose server side is driven by the test.
    #[derive(Default, Clone)]
    pub struct MockPushStreamFactory {
        state: Arc<MockStreamState>,
    }

    impl MockPushStreamFactory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn opened(&self) -> usize {
            self.state.opened.load(Ordering::SeqCst)
        }

        /// Number of `StreamCloser::close` calls observed.
        pub fn closed(&self) -> usize {
            self.state.closed.load(Ordering::SeqCst)
        }

        pub fn tokens(&self) -> Vec<String> {
            lock(&self.state.tokens).clone()
        }

        /// Delivers one event's data on the latest stream.
        pub async fn send(&self, data: impl Into<String>) -> bool {
            let server = lock(&self.state.server).clone();
            match server {
                Some(tx) => tx.send(data.into()).await.is_ok(),
                None => false,
            }
        }

        /// Ends the latest stream from the server side.
        pub fn end(&self) {
            lock(&self.state.server).take();
        }
    }

    #[async_trait]
    impl PushStreamFactory for MockPushStreamFactory {
        async fn open_stream(
            &self,
            _url: &str,
            token: &str,
        ) -> Result<(Arc<dyn StreamCloser>, mpsc::Receiver<String>), anyhow::Error> {
            self.state.opened.fetch_add(1, Ordering::SeqCst);
            lock(&self.state.tokens).push(token.to_string());
            let (tx, rx) = mpsc::channel(64);
            *lock(&self.state.server) = Some(tx);
            let closer = MockCloser {
                closed: self.state.closed.clone(),
            };
            Ok((Arc::new(closer), rx))
        }
    }
}
