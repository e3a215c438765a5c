use livecore::QueryKey;
use thiserror::Error;

/// Failure to establish or use the live connection. The only error that
/// propagates to callers; nothing retries it internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("no bearer credential was provided")]
    MissingCredential,
    #[error("connection setup failed: {0}")]
    Network(String),
    #[error("transport handle is closed")]
    Closed,
    #[error("a push stream is already open")]
    StreamAlreadyOpen,
}

/// Failure while tearing down a subscription. Logged, never returned.
#[derive(Debug, Error)]
#[error("teardown of '{key}' failed: {source}")]
pub struct TeardownError {
    pub key: QueryKey,
    #[source]
    pub source: ConnectionError,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("consumer {consumer} already holds a subscription to '{key}'")]
    AlreadySubscribed { key: QueryKey, consumer: u64 },
}

/// Failure of a pull query. Cloned to every caller sharing the fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("server answered with status {0}")]
    Status(u16),
    #[error("response could not be decoded: {0}")]
    Decode(String),
    #[error("'{0}' is not fetched over HTTP")]
    NotFetchable(QueryKey),
    #[error("no credential for the request")]
    MissingCredential,
    #[error("fetch was abandoned before it completed")]
    Cancelled,
}
