use crate::error::MalformedEventError;
use crate::types::notification::ChatNotification;
use serde_json::Value;

pub const CHAT_GROUP_MESSAGE: &str = "chat-group-message";

/// A decoded server-push envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEnvelope {
    ChatGroupMessage(ChatNotification),
    /// Any kind this client does not recognize. Kept rather than rejected so
    /// the router can report it.
    Unsupported { event_name: String, payload: Value },
}

impl PushEnvelope {
    /// Decodes one `data:` line of the push stream.
    pub fn decode(raw: &str) -> Result<Self, MalformedEventError> {
        let value: Value = serde_json::from_str(raw)?;
        let event_name = value
            .get("eventName")
            .and_then(Value::as_str)
            .ok_or(MalformedEventError::MissingEventName)?
            .to_string();

        match event_name.as_str() {
            CHAT_GROUP_MESSAGE => serde_json::from_value(value)
                .map(Self::ChatGroupMessage)
                .map_err(|source| MalformedEventError::Payload {
                    event: event_name,
                    source,
                }),
            _ => Ok(Self::Unsupported {
                event_name,
                payload: value,
            }),
        }
    }

    pub fn event_name(&self) -> &str {
        match self {
            Self::ChatGroupMessage(_) => CHAT_GROUP_MESSAGE,
            Self::Unsupported { event_name, .. } => event_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ids::{GroupId, UserId};

    #[test]
    fn decodes_chat_group_message() {
        let raw = r#"{"eventName":"chat-group-message","message":{"User":{"ID":3},"Group":{"ID":9,"Name":"math"},"Content":"hey"}}"#;
        match PushEnvelope::decode(raw).unwrap() {
            PushEnvelope::ChatGroupMessage(n) => {
                assert_eq!(n.message.sender(), UserId(3));
                assert_eq!(n.message.group_id(), GroupId(9));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_kept() {
        let envelope = PushEnvelope::decode(r#"{"eventName":"foo","x":1}"#).unwrap();
        assert_eq!(envelope.event_name(), "foo");
        assert!(matches!(envelope, PushEnvelope::Unsupported { .. }));
    }

    #[test]
    fn missing_name_or_body_is_malformed() {
        assert!(matches!(
            PushEnvelope::decode(r#"{"message":{}}"#),
            Err(MalformedEventError::MissingEventName)
        ));
        assert!(matches!(
            PushEnvelope::decode(r#"{"eventName":"chat-group-message"}"#),
            Err(MalformedEventError::Payload { .. })
        ));
    }
}
