use crate::types::ids::{GroupId, MessageId};
use serde::Serialize;
use serde_json::Value;

/// Events the client emits on the bidirectional channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    JoinRoom(RoomRef),
    LeaveRoom(RoomRef),
    CreateMessage(CreateMessage),
    Typing(SendTyping),
    DeleteMessage(MessageRef),
    EditMessage(EditMessage),
    ReactToMessage(ReactToMessage),
    GetMessageInfo(MessageRef),
    LeaveMessageInfoRoom(MessageRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoomRef {
    #[serde(rename = "ChatGroupId")]
    pub chat_group_id: GroupId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessageRef {
    #[serde(rename = "MessageID")]
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateMessage {
    #[serde(rename = "Content")]
    pub content: String,
    #[serde(rename = "GroupID")]
    pub group_id: GroupId,
    #[serde(rename = "RepliedToMessageID", skip_serializing_if = "Option::is_none")]
    pub replied_to: Option<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SendTyping {
    #[serde(rename = "IsTyping")]
    pub is_typing: bool,
    #[serde(rename = "GroupID")]
    pub group_id: GroupId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditMessage {
    #[serde(rename = "MessageID")]
    pub message_id: MessageId,
    #[serde(rename = "Content")]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactToMessage {
    #[serde(rename = "MessageID")]
    pub message_id: MessageId,
    #[serde(rename = "Reaction")]
    pub reaction: String,
}

impl ClientEvent {
    pub fn join_room(group: GroupId) -> Self {
        Self::JoinRoom(RoomRef {
            chat_group_id: group,
        })
    }

    pub fn leave_room(group: GroupId) -> Self {
        Self::LeaveRoom(RoomRef {
            chat_group_id: group,
        })
    }

    pub fn get_message_info(message: MessageId) -> Self {
        Self::GetMessageInfo(MessageRef {
            message_id: message,
        })
    }

    pub fn leave_message_info_room(message: MessageId) -> Self {
        Self::LeaveMessageInfoRoom(MessageRef {
            message_id: message,
        })
    }

    /// The event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "joinRoom",
            Self::LeaveRoom(_) => "leaveRoom",
            Self::CreateMessage(_) => "createMessage",
            Self::Typing(_) => "typing",
            Self::DeleteMessage(_) => "deleteMessage",
            Self::EditMessage(_) => "editMessage",
            Self::ReactToMessage(_) => "reactToMessage",
            Self::GetMessageInfo(_) => "getMessageInfo",
            Self::LeaveMessageInfoRoom(_) => "leaveMessageInfoRoom",
        }
    }

    pub fn payload(&self) -> Value {
        let encoded = match self {
            Self::JoinRoom(room) | Self::LeaveRoom(room) => serde_json::to_value(room),
            Self::CreateMessage(msg) => serde_json::to_value(msg),
            Self::Typing(typing) => serde_json::to_value(typing),
            Self::DeleteMessage(msg)
            | Self::GetMessageInfo(msg)
            | Self::LeaveMessageInfoRoom(msg) => serde_json::to_value(msg),
            Self::EditMessage(edit) => serde_json::to_value(edit),
            Self::ReactToMessage(reaction) => serde_json::to_value(reaction),
        };
        // Plain structs of ids and strings always serialize.
        encoded.unwrap_or(Value::Null)
    }

    /// Encodes the event as a wire frame.
    pub fn to_frame(&self) -> String {
        crate::framing::encode_frame(self.name(), &self.payload())
    }
}
