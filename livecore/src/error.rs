use thiserror::Error;

/// A push payload that could not be decoded into its typed form.
///
/// Always contained: callers log it and drop the event.
#[derive(Debug, Error)]
pub enum MalformedEventError {
    #[error("event '{event}' has a malformed payload: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not an [eventName, payload] pair")]
    FrameShape,
    #[error("envelope has no eventName")]
    MissingEventName,
}

/// A push envelope kind this client does not know how to handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0} is not a supported notification type")]
pub struct UnsupportedEventKind(pub String);
