//! Text framing for the bidirectional channel.
//!
//! Each frame is a JSON array `["eventName", payload]`. A frame without a
//! payload element decodes with a `null` payload.

use crate::error::MalformedEventError;
use serde_json::Value;

pub fn encode_frame(event: &str, payload: &Value) -> String {
    Value::Array(vec![Value::String(event.to_string()), payload.clone()]).to_string()
}

pub fn decode_frame(text: &str) -> Result<(String, Value), MalformedEventError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Array(mut parts) = value else {
        return Err(MalformedEventError::FrameShape);
    };
    if parts.is_empty() || parts.len() > 2 {
        return Err(MalformedEventError::FrameShape);
    }
    let payload = if parts.len() == 2 {
        parts.pop().unwrap_or(Value::Null)
    } else {
        Value::Null
    };
    match parts.pop() {
        Some(Value::String(name)) => Ok((name, payload)),
        _ => Err(MalformedEventError::FrameShape),
    }
}
