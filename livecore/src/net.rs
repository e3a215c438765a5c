use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A text frame has been received from the server.
    FrameReceived(String),
    /// The connection was lost.
    Disconnected,
}

/// Represents an active bidirectional connection.
/// The transport moves text frames and knows nothing about event names.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one text frame to the server.
    async fn send(&self, frame: &str) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Creates a new authenticated transport and returns it, along with a
    /// stream of events.
    async fn create_transport(
        &self,
        credential: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

/// Closes an open push stream. Closing twice is harmless.
pub trait StreamCloser: Send + Sync {
    fn close(&self);
}

/// Opens one-way server-push streams.
#[async_trait]
pub trait PushStreamFactory: Send + Sync {
    /// Opens a stream to `url` authenticated with `token`. Each received
    /// item is the raw data of one server event.
    async fn open_stream(
        &self,
        url: &str,
        token: &str,
    ) -> Result<(Arc<dyn StreamCloser>, mpsc::Receiver<String>), anyhow::Error>;
}

/// A simple structure to represent an HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: String, // "GET", "POST" or "PATCH"
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self::with_method("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::with_method("POST", url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::with_method("PATCH", url)
    }

    fn with_method(method: &str, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_bearer(self, token: &str) -> Self {
        self.with_header("Authorization", format!("Bearer {token}"))
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

/// A simple structure for the HTTP response
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Box<dyn Read + Send + Sync>,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status_code", &self.status_code)
            .field("body", &"<streaming reader>")
            .finish()
    }
}

impl HttpResponse {
    /// Creates an HTTP response with an in-memory body.
    pub fn from_bytes(status_code: u16, body: Vec<u8>) -> Self {
        HttpResponse {
            status_code,
            body: Box::new(std::io::Cursor::new(body)),
        }
    }

    pub fn empty(status_code: u16) -> Self {
        Self::from_bytes(status_code, Vec::new())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Consumes the response and reads all body content into a Vec<u8>.
    pub fn body_into_vec(mut self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.body.read_to_end(&mut buffer)?;
        Ok(buffer)
    }
}

/// Trait for executing HTTP requests in a runtime-agnostic way
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Executes a given HTTP request and returns the response.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}
