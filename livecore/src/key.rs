use crate::types::ids::{GroupId, MessageId};
use std::fmt;

/// Tag provided by the paginated notification queries.
pub const USER_NOTIFICATIONS_TAG: &str = "User Notifications";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    GroupMessages,
    TypingUsers,
    MessageInfo,
    UserNotifications,
    MessageNotifications,
}

/// Identity of a cached, subscribable resource instance.
///
/// Equal keys always resolve to the same cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryKey {
    GroupMessages(GroupId),
    TypingUsers,
    MessageInfo(MessageId),
    UserNotifications { limit: u32, offset: u32 },
    MessageNotifications,
}

impl QueryKey {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::GroupMessages(_) => ResourceKind::GroupMessages,
            Self::TypingUsers => ResourceKind::TypingUsers,
            Self::MessageInfo(_) => ResourceKind::MessageInfo,
            Self::UserNotifications { .. } => ResourceKind::UserNotifications,
            Self::MessageNotifications => ResourceKind::MessageNotifications,
        }
    }

    /// Live keys are fed by the bidirectional channel; the others are
    /// fetched over HTTP.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::GroupMessages(_) | Self::TypingUsers | Self::MessageInfo(_)
        )
    }

    /// Cache tags this key provides, used for tag invalidation.
    pub fn tags(&self) -> &'static [&'static str] {
        match self {
            Self::UserNotifications { .. } => &[USER_NOTIFICATIONS_TAG],
            _ => &[],
        }
    }

    pub fn provides(&self, tag: &str) -> bool {
        self.tags().contains(&tag)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GroupMessages(group) => write!(f, "group:{group} messages"),
            Self::TypingUsers => write!(f, "typing users"),
            Self::MessageInfo(message) => write!(f, "message:{message} info"),
            Self::UserNotifications { limit, offset } => {
                write!(f, "notifications limit={limit} offset={offset}")
            }
            Self::MessageNotifications => write!(f, "message notifications"),
        }
    }
}
