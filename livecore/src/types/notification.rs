use crate::types::ids::{GroupId, UserId};
use crate::types::message::UserSummary;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Group reference embedded in a chat notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupSummary {
    #[serde(rename = "ID")]
    pub id: GroupId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The message carried by a `chat-group-message` push envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NotificationMessage {
    pub user: UserSummary,
    pub group: GroupSummary,
    #[serde(default)]
    pub content: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NotificationMessage {
    pub fn sender(&self) -> UserId {
        self.user.id
    }

    pub fn group_id(&self) -> GroupId {
        self.group.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatNotification {
    pub message: NotificationMessage,
}

/// A stored notification as returned by `GET /notifications`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredNotification {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "eventName")]
    pub event_name: String,
    #[serde(rename = "Read", default)]
    pub read: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One page of the user's notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationPage {
    #[serde(default)]
    pub data: Vec<StoredNotification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Unread-message summary per group (`GET /notifications/messages`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesNotification {
    #[serde(rename = "GroupID")]
    pub group_id: GroupId,
    #[serde(rename = "Count", default)]
    pub count: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body of `PATCH /notifications/read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadNotification {
    #[serde(rename = "NotificationIDs")]
    pub notification_ids: Vec<i64>,
}
