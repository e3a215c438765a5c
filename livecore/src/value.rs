use crate::key::{QueryKey, ResourceKind};
use crate::merge::{self, CollectionEvent};
use crate::types::events::PushEvent;
use crate::types::message::{MessageInfo, SerializedMessage};
use crate::types::notification::{MessagesNotification, NotificationPage};
use log::debug;

/// The typed value held by a cache entry.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Messages(Vec<SerializedMessage>),
    Typing(Vec<String>),
    MessageInfo(Vec<MessageInfo>),
    Notifications(NotificationPage),
    MessageNotifications(Vec<MessagesNotification>),
}

impl CachedValue {
    /// The value a fresh entry for `key` starts with.
    pub fn empty_for(key: &QueryKey) -> Self {
        match key.kind() {
            ResourceKind::GroupMessages => Self::Messages(Vec::new()),
            ResourceKind::TypingUsers => Self::Typing(Vec::new()),
            ResourceKind::MessageInfo => Self::MessageInfo(Vec::new()),
            ResourceKind::UserNotifications => Self::Notifications(NotificationPage::default()),
            ResourceKind::MessageNotifications => Self::MessageNotifications(Vec::new()),
        }
    }

    pub fn as_messages(&self) -> Option<&[SerializedMessage]> {
        match self {
            Self::Messages(messages) => Some(messages),
            _ => None,
        }
    }

    pub fn as_typing(&self) -> Option<&[String]> {
        match self {
            Self::Typing(users) => Some(users),
            _ => None,
        }
    }

    pub fn as_message_info(&self) -> Option<&[MessageInfo]> {
        match self {
            Self::MessageInfo(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_notifications(&self) -> Option<&NotificationPage> {
        match self {
            Self::Notifications(page) => Some(page),
            _ => None,
        }
    }

    pub fn as_message_notifications(&self) -> Option<&[MessagesNotification]> {
        match self {
            Self::MessageNotifications(list) => Some(list),
            _ => None,
        }
    }

    /// Merges a push event into this value. Returns `true` if the value
    /// changed. An event that does not target this value's kind is ignored.
    pub fn apply_event(&mut self, event: &PushEvent) -> bool {
        match (self, event) {
            (Self::Messages(messages), PushEvent::AllMessages(snapshot)) => {
                merge::apply(messages, CollectionEvent::Replace(snapshot.clone()))
            }
            (Self::Messages(messages), PushEvent::NewMessage(message)) => {
                merge::apply(messages, CollectionEvent::Append(message.clone()))
            }
            (Self::Messages(messages), PushEvent::EditedMessage(message)) => {
                merge::apply(messages, CollectionEvent::Update(message.clone()))
            }
            (Self::Messages(messages), PushEvent::DeletedMessage(deleted)) => {
                merge::apply(messages, CollectionEvent::Remove(deleted.message_id))
            }
            (Self::Typing(users), PushEvent::Typing(update)) => {
                merge::apply_typing(users, &update.username, update.is_typing)
            }
            (
                Self::MessageInfo(info),
                PushEvent::MessageInfo(snapshot) | PushEvent::NewMessageReadInfo(snapshot),
            ) => {
                *info = snapshot.clone();
                true
            }
            (_, event) => {
                debug!(target: "Merge", "Ignoring '{}' for a value of another kind", event.name());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ids::{GroupId, MessageId};
    use crate::types::message::{DeletedMessage, TypingUpdate};
    use serde_json::json;

    fn message(id: i64, content: &str) -> SerializedMessage {
        serde_json::from_value(json!({ "MessageID": id, "Content": content, "GroupID": 5 }))
            .unwrap()
    }

    fn ids(value: &CachedValue) -> Vec<i64> {
        value
            .as_messages()
            .unwrap()
            .iter()
            .map(|m| m.message_id.0)
            .collect()
    }

    #[test]
    fn group_scenario_replace_append_update_remove() {
        let key = QueryKey::GroupMessages(GroupId(5));
        let mut value = CachedValue::empty_for(&key);

        value.apply_event(&PushEvent::AllMessages(vec![message(1, "")]));
        assert_eq!(ids(&value), vec![1]);

        value.apply_event(&PushEvent::NewMessage(message(2, "")));
        assert_eq!(ids(&value), vec![1, 2]);

        value.apply_event(&PushEvent::EditedMessage(message(1, "x")));
        assert_eq!(ids(&value), vec![1, 2]);
        assert_eq!(value.as_messages().unwrap()[0].content, "x");

        value.apply_event(&PushEvent::DeletedMessage(DeletedMessage {
            message_id: MessageId(2),
            group_id: Some(GroupId(5)),
        }));
        assert_eq!(ids(&value), vec![1]);
        assert_eq!(value.as_messages().unwrap()[0].content, "x");
    }

    #[test]
    fn mismatched_kind_is_ignored() {
        let mut value = CachedValue::empty_for(&QueryKey::TypingUsers);
        assert!(!value.apply_event(&PushEvent::NewMessage(message(1, ""))));
        assert_eq!(value, CachedValue::Typing(Vec::new()));
    }

    #[test]
    fn typing_updates_merge_into_set() {
        let mut value = CachedValue::empty_for(&QueryKey::TypingUsers);
        value.apply_event(&PushEvent::Typing(TypingUpdate {
            username: "ana".into(),
            is_typing: true,
        }));
        value.apply_event(&PushEvent::Typing(TypingUpdate {
            username: "ana".into(),
            is_typing: true,
        }));
        assert_eq!(value.as_typing().unwrap(), ["ana".to_string()]);
    }
}
