use std::sync::Arc;

use dingcrust_common::OutboundMessage;
use reqwest::Method;
use serde_json::json;
use tracing::{debug, warn};

use super::api::DingTalkApi;
use super::error::DingTalkError;
use super::route::{GROUP_CONVERSATION_TYPE, META_CONVERSATION_TYPE};

const BATCH_SEND_PATH: &str = "/v1.0/robot/oToMessages/batchSend";
const REPLY_TITLE: &str = "Dingcrust Reply";

/// Plain markdown delivery through the robot's 1:1 batch-send endpoint.
pub struct TextSender {
    api: Arc<DingTalkApi>,
    robot_code: String,
}

impl TextSender {
    pub fn new(api: Arc<DingTalkApi>, robot_code: impl Into<String>) -> Self {
        Self {
            api,
            robot_code: robot_code.into(),
        }
    }

    /// Send `msg` as a markdown message to `msg.chat_id`.
    ///
    /// The batch-send endpoint only reaches individual users, so group
    /// conversations are skipped with a warning.
    pub async fn send(&self, msg: &OutboundMessage) -> Result<(), DingTalkError> {
        let is_group = msg
            .metadata
            .get(META_CONVERSATION_TYPE)
            .and_then(|v| v.as_str())
            == Some(GROUP_CONVERSATION_TYPE);
        if is_group {
            warn!(
                "dingtalk: plain-text replies to group {} are not supported, dropping message",
                msg.chat_id
            );
            return Ok(());
        }

        let msg_param = json!({
            "text": msg.content,
            "title": REPLY_TITLE,
        });
        let body = json!({
            "robotCode": self.robot_code,
            "userIds": [msg.chat_id],
            "msgKey": "sampleMarkdown",
            "msgParam": msg_param.to_string(),
        });

        self.api
            .call("text send", Method::POST, BATCH_SEND_PATH, &body)
            .await?;
        debug!("dingtalk: text message sent to {}", msg.chat_id);
        Ok(())
    }
}
