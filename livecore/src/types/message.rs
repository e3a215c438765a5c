use crate::merge::Identified;
use crate::types::ids::{GroupId, MessageId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Minimal view of a user as embedded in messages and notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserSummary {
    #[serde(rename = "ID")]
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Reaction {
    pub reaction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
}

/// A chat message as the server serializes it.
///
/// `MessageID` is mandatory: it is the identity the merge engine matches on,
/// so a payload without it fails to decode. Fields the cache layer does not
/// interpret are carried through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SerializedMessage {
    #[serde(rename = "MessageID")]
    pub message_id: MessageId,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "GroupID", default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<Reaction>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Identified for SerializedMessage {
    type Id = MessageId;

    fn identity(&self) -> MessageId {
        self.message_id
    }
}

/// Read receipt for a message (`messageInfo` / `newMessageReadInfo`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageInfo {
    pub user: UserSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Server `isTyping` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TypingUpdate {
    pub username: String,
    pub is_typing: bool,
}

/// Server `deletedMessage` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedMessage {
    #[serde(rename = "MessageID")]
    pub message_id: MessageId,
    #[serde(rename = "GroupID", default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_keeps_unknown_fields() {
        let raw = json!({
            "MessageID": 3,
            "Content": "hi",
            "GroupID": 5,
            "User": { "ID": 9, "Username": "ana" },
            "RepliedToMessage": { "MessageID": 1 }
        });
        let msg: SerializedMessage = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(msg.message_id, MessageId(3));
        assert_eq!(msg.group_id, Some(GroupId(5)));
        assert!(msg.extra.contains_key("RepliedToMessage"));
        assert_eq!(serde_json::to_value(&msg).unwrap(), raw);
    }

    #[test]
    fn message_without_identity_is_rejected() {
        let raw = json!({ "Content": "no id" });
        assert!(serde_json::from_value::<SerializedMessage>(raw).is_err());
    }

    #[test]
    fn typing_update_uses_server_field_names() {
        let update: TypingUpdate =
            serde_json::from_value(json!({ "Username": "bob", "IsTyping": true })).unwrap();
        assert_eq!(update.username, "bob");
        assert!(update.is_typing);
    }
}
