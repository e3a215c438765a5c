pub mod events;
pub mod ids;
pub mod message;
pub mod notification;

pub use ids::{GroupId, MessageId, UserId};
pub use message::{DeletedMessage, MessageInfo, Reaction, SerializedMessage, TypingUpdate, UserSummary};
pub use notification::{
    ChatNotification, GroupSummary, MessagesNotification, NotificationMessage, NotificationPage,
    ReadNotification, StoredNotification,
};
