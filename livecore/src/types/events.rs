use crate::error::MalformedEventError;
use crate::types::message::{DeletedMessage, MessageInfo, SerializedMessage, TypingUpdate};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Names of the events the server emits on the bidirectional channel.
pub mod names {
    pub const ALL_MESSAGES: &str = "allMessages";
    pub const NEW_MESSAGE: &str = "newMessage";
    pub const EDITED_MESSAGE: &str = "editedMessage";
    pub const DELETED_MESSAGE: &str = "deletedMessage";
    pub const IS_TYPING: &str = "isTyping";
    pub const MESSAGE_INFO: &str = "messageInfo";
    pub const NEW_MESSAGE_READ_INFO: &str = "newMessageReadInfo";
}

/// A decoded server event, ready to be merged into a cached collection.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    AllMessages(Vec<SerializedMessage>),
    NewMessage(SerializedMessage),
    EditedMessage(SerializedMessage),
    DeletedMessage(DeletedMessage),
    Typing(TypingUpdate),
    MessageInfo(Vec<MessageInfo>),
    NewMessageReadInfo(Vec<MessageInfo>),
}

impl PushEvent {
    /// Decodes a server event by name.
    ///
    /// Returns `Ok(None)` for names this layer does not consume.
    pub fn decode(name: &str, payload: Value) -> Result<Option<Self>, MalformedEventError> {
        let event = match name {
            names::ALL_MESSAGES => Self::AllMessages(parse(name, payload)?),
            names::NEW_MESSAGE => Self::NewMessage(parse(name, payload)?),
            names::EDITED_MESSAGE => Self::EditedMessage(parse(name, payload)?),
            names::DELETED_MESSAGE => Self::DeletedMessage(parse(name, payload)?),
            names::IS_TYPING => Self::Typing(parse(name, payload)?),
            names::MESSAGE_INFO => Self::MessageInfo(parse(name, payload)?),
            names::NEW_MESSAGE_READ_INFO => Self::NewMessageReadInfo(parse(name, payload)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AllMessages(_) => names::ALL_MESSAGES,
            Self::NewMessage(_) => names::NEW_MESSAGE,
            Self::EditedMessage(_) => names::EDITED_MESSAGE,
            Self::DeletedMessage(_) => names::DELETED_MESSAGE,
            Self::Typing(_) => names::IS_TYPING,
            Self::MessageInfo(_) => names::MESSAGE_INFO,
            Self::NewMessageReadInfo(_) => names::NEW_MESSAGE_READ_INFO,
        }
    }
}

fn parse<T: DeserializeOwned>(event: &str, payload: Value) -> Result<T, MalformedEventError> {
    serde_json::from_value(payload).map_err(|source| MalformedEventError::Payload {
        event: event.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ids::MessageId;
    use serde_json::json;

    #[test]
    fn decodes_known_events() {
        let event = PushEvent::decode("newMessage", json!({ "MessageID": 2, "Content": "yo" }))
            .unwrap()
            .unwrap();
        match event {
            PushEvent::NewMessage(msg) => assert_eq!(msg.message_id, MessageId(2)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_names_are_not_consumed() {
        assert!(PushEvent::decode("somethingElse", json!({})).unwrap().is_none());
    }

    #[test]
    fn edit_without_identity_is_malformed() {
        let err = PushEvent::decode("editedMessage", json!({ "Content": "x" })).unwrap_err();
        assert!(matches!(err, MalformedEventError::Payload { ref event, .. } if event == "editedMessage"));
    }

    #[test]
    fn name_round_trips() {
        let event = PushEvent::decode("isTyping", json!({ "Username": "a", "IsTyping": false }))
            .unwrap()
            .unwrap();
        assert_eq!(event.name(), "isTyping");
    }
}
