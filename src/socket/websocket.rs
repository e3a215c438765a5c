//! WebSocket implementation of [`Transport`] built on tokio-tungstenite.
//!
//! Frames are exchanged as text messages; the bearer credential is sent in
//! the `Authorization` header of the upgrade request.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use livecore::net::{Transport, TransportEvent, TransportFactory};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const FRAME_MAX_SIZE: usize = 1 << 20;

pub struct WebSocketTransport {
    ws_sink: Mutex<Option<WsSink>>,
}

impl WebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Mutex::new(Some(sink)),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, frame: &str) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        if frame.len() >= FRAME_MAX_SIZE {
            return Err(anyhow::anyhow!(
                "Frame is too large (max: {}, got: {})",
                FRAME_MAX_SIZE,
                frame.len()
            ));
        }

        debug!(target: "Socket", "--> Sending frame: {} bytes", frame.len());
        sink.send(Message::text(frame))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(target: "Socket", "Error while closing websocket: {e}");
            }
        }
    }
}

/// Factory for authenticated WebSocket transports to a fixed URL.
pub struct WebSocketTransportFactory {
    url: String,
    capacity: usize,
}

impl WebSocketTransportFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            capacity: 100,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

#[async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn create_transport(
        &self,
        credential: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!(target: "Socket", "Dialing {}", self.url);
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| anyhow::anyhow!("Failed to build request for {}: {}", self.url, e))?;
        let auth = HeaderValue::from_str(&format!("Bearer {credential}"))
            .map_err(|e| anyhow::anyhow!("Credential is not a valid header value: {}", e))?;
        request.headers_mut().insert("Authorization", auth);

        let (client, _response) = connect_async(request)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = client.split();
        let (event_tx, event_rx) = mpsc::channel(self.capacity);
        let transport = Arc::new(WebSocketTransport::new(sink));

        tokio::task::spawn(read_pump(stream, event_tx.clone()));
        let _ = event_tx.send(TransportEvent::Connected).await;

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!(target: "Socket", "<-- Received frame: {} bytes", text.len());
                if event_tx
                    .send(TransportEvent::FrameReceived(text.as_str().to_owned()))
                    .await
                    .is_err()
                {
                    warn!(target: "Socket", "Event receiver dropped, closing read pump");
                    break;
                }
            }
            Some(Ok(Message::Close(_))) => {
                trace!(target: "Socket", "Received close frame");
                break;
            }
            Some(Ok(other)) => {
                trace!(target: "Socket", "Ignoring non-text message: {:?}", other);
            }
            Some(Err(e)) => {
                error!(target: "Socket", "Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!(target: "Socket", "Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Disconnected).await;
}
