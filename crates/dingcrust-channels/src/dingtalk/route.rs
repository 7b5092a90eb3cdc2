use std::fmt;

use dingcrust_common::Metadata;

pub const META_CONVERSATION_TYPE: &str = "_dingtalk_conversation_type";
pub const META_CONVERSATION_ID: &str = "_dingtalk_conversation_id";
pub const META_SENDER_STAFF_ID: &str = "_dingtalk_sender_staff_id";
pub const META_SENDER_ID: &str = "_dingtalk_sender_id";
pub const META_SENDER_CORP_ID: &str = "_dingtalk_sender_corp_id";
pub const META_MESSAGE_ID: &str = "_dingtalk_message_id";

/// DingTalk's `conversationType` value for group chats; anything else is a 1:1 chat.
pub const GROUP_CONVERSATION_TYPE: &str = "2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn from_type(conversation_type: &str) -> Self {
        if conversation_type == GROUP_CONVERSATION_TYPE {
            Self::Group
        } else {
            Self::Direct
        }
    }
}

/// Registry key for one chat thread: the group id for group chats, the
/// sender for direct chats.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn group(conversation_id: &str) -> Self {
        Self(format!("group:{conversation_id}"))
    }

    pub fn direct(sender: &str) -> Self {
        Self(format!("direct:{sender}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a card is delivered, extracted from message routing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardRoute {
    pub kind: ConversationKind,
    pub conversation_id: String,
    pub sender_staff_id: String,
    pub sender_id: String,
}

fn meta_str<'a>(metadata: &'a Metadata, key: &str) -> &'a str {
    metadata.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

impl CardRoute {
    /// Returns `None` when the metadata carries no conversation-type marker,
    /// i.e. the message was not routed for card delivery.
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let conversation_type = metadata.get(META_CONVERSATION_TYPE).and_then(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })?;
        if conversation_type.is_empty() {
            return None;
        }

        Some(Self {
            kind: ConversationKind::from_type(&conversation_type),
            conversation_id: meta_str(metadata, META_CONVERSATION_ID).to_string(),
            sender_staff_id: meta_str(metadata, META_SENDER_STAFF_ID).to_string(),
            sender_id: meta_str(metadata, META_SENDER_ID).to_string(),
        })
    }

    /// The sender identity used for direct chats (staff id when known).
    pub fn direct_sender(&self) -> &str {
        if self.sender_staff_id.is_empty() {
            &self.sender_id
        } else {
            &self.sender_staff_id
        }
    }

    pub fn key(&self) -> ConversationKey {
        match self.kind {
            ConversationKind::Group => ConversationKey::group(&self.conversation_id),
            ConversationKind::Direct => ConversationKey::direct(self.direct_sender()),
        }
    }

    /// `openSpaceId` addressing the chat the card is delivered into.
    pub fn open_space_id(&self) -> String {
        match self.kind {
            ConversationKind::Group => format!("dtv1.card//IM_GROUP.{}", self.conversation_id),
            ConversationKind::Direct => format!("dtv1.card//IM_ROBOT.{}", self.sender_staff_id),
        }
    }
}
