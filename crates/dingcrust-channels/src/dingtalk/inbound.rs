use std::sync::Arc;

use dingcrust_common::{InboundMessage, MessageBus, Metadata, Result};
use dingcrust_config::ReplyMode;
use dingcrust_security::Allowlist;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::dispatcher::DeliveryDispatcher;
use super::route::{
    CardRoute, GROUP_CONVERSATION_TYPE, META_CONVERSATION_ID, META_CONVERSATION_TYPE,
    META_MESSAGE_ID, META_SENDER_CORP_ID, META_SENDER_ID, META_SENDER_STAFF_ID,
};

pub const CHANNEL_NAME: &str = "dingtalk";

#[derive(Debug, Default, Deserialize)]
struct TextContent {
    #[serde(default)]
    content: String,
}

/// Robot callback payload, as delivered on the chatbot topic.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ChatbotPayload {
    text: Option<TextContent>,
    msgtype: Option<String>,
    sender_staff_id: Option<String>,
    sender_id: Option<String>,
    sender_nick: Option<String>,
    conversation_type: Option<Value>,
    conversation_id: Option<String>,
    sender_corp_id: Option<String>,
    msg_id: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

/// Turn a chatbot callback into an inbound message.
///
/// Returns `None` for messages without text content (pictures, files,
/// unsupported types). Routing fields for card delivery are only attached in
/// AI-card mode; in text mode every reply goes 1:1 to the sender.
pub fn parse_chatbot_message(data: &Value, reply_mode: ReplyMode) -> Option<InboundMessage> {
    let payload: ChatbotPayload = match serde_json::from_value(data.clone()) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("dingtalk: malformed chatbot message: {e}");
            return None;
        }
    };

    let content = payload
        .text
        .as_ref()
        .map(|t| t.content.trim().to_string())
        .unwrap_or_default();
    if content.is_empty() {
        warn!(
            "dingtalk: ignoring empty or unsupported message (type {})",
            payload.msgtype.as_deref().unwrap_or("unknown")
        );
        return None;
    }

    let staff_id = non_empty(payload.sender_staff_id).unwrap_or_default();
    let raw_sender_id = non_empty(payload.sender_id).unwrap_or_default();
    let sender_id = if staff_id.is_empty() {
        raw_sender_id.clone()
    } else {
        staff_id.clone()
    };
    let sender_name = non_empty(payload.sender_nick).unwrap_or_else(|| "Unknown".to_string());
    let conversation_id = non_empty(payload.conversation_id).unwrap_or_default();

    let mut metadata = Metadata::new();
    metadata.insert("sender_name".into(), json!(sender_name));
    metadata.insert("platform".into(), json!(CHANNEL_NAME));

    let mut chat_id = sender_id.clone();
    if reply_mode == ReplyMode::AiCard {
        let conversation_type = match payload.conversation_type {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        if conversation_type == GROUP_CONVERSATION_TYPE && !conversation_id.is_empty() {
            chat_id = conversation_id.clone();
        }
        metadata.insert(META_CONVERSATION_TYPE.into(), json!(conversation_type));
        metadata.insert(META_CONVERSATION_ID.into(), json!(conversation_id));
        metadata.insert(META_SENDER_STAFF_ID.into(), json!(staff_id));
        metadata.insert(META_SENDER_ID.into(), json!(raw_sender_id));
        metadata.insert(
            META_SENDER_CORP_ID.into(),
            json!(payload.sender_corp_id.unwrap_or_default()),
        );
        metadata.insert(
            META_MESSAGE_ID.into(),
            json!(payload.msg_id.unwrap_or_default()),
        );
    }

    info!("dingtalk: message from {sender_name} ({sender_id})");
    Some(InboundMessage::new(CHANNEL_NAME, sender_id, chat_id, content).with_metadata(metadata))
}

/// Accepts parsed inbound messages: permission check, card interruption,
/// then hand-off to the bus.
pub struct InboundHandler {
    dispatcher: Arc<DeliveryDispatcher>,
    bus: Arc<MessageBus>,
    allowlist: Allowlist,
}

impl InboundHandler {
    pub fn new(
        dispatcher: Arc<DeliveryDispatcher>,
        bus: Arc<MessageBus>,
        allowlist: Allowlist,
    ) -> Self {
        Self {
            dispatcher,
            bus,
            allowlist,
        }
    }

    /// Returns `Ok(false)` when the sender is not permitted.
    ///
    /// An open card for the same conversation is finished before the message
    /// reaches the bus, so a new turn never starts over a frozen card.
    pub async fn on_message(&self, msg: InboundMessage) -> Result<bool> {
        if !self.allowlist.is_allowed(&msg.sender_id) {
            warn!(
                "dingtalk: sender {} is not in allow_from, dropping message",
                msg.sender_id
            );
            return Ok(false);
        }

        if let Some(route) = CardRoute::from_metadata(&msg.metadata) {
            self.dispatcher.interrupt(&route.key()).await;
        }

        self.bus.publish_inbound(msg).await?;
        Ok(true)
    }
}
