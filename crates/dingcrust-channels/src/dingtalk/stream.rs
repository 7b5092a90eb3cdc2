//! DingTalk Stream Mode: a long-lived WebSocket over which the platform
//! pushes robot callbacks, in place of a public webhook.

use std::sync::Arc;
use std::time::Duration;

use dingcrust_common::InboundMessage;
use dingcrust_config::{DingTalkConfig, ReplyMode};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::api::DingTalkApi;
use super::error::DingTalkError;
use super::inbound::{InboundHandler, parse_chatbot_message};
use super::tasks::TaskPool;

const GATEWAY_OPEN_PATH: &str = "/v1.0/gateway/connections/open";
pub const CHATBOT_TOPIC: &str = "/v1.0/im/bot/messages/get";
const USER_AGENT: &str = concat!("dingcrust/", env!("CARGO_PKG_VERSION"));

type GatewaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where to connect, as handed out by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEndpoint {
    pub endpoint: String,
    pub ticket: String,
}

impl GatewayEndpoint {
    pub fn url(&self) -> Result<Url, DingTalkError> {
        Url::parse_with_params(&self.endpoint, &[("ticket", &self.ticket)])
            .map_err(|e| DingTalkError::Stream(format!("invalid gateway endpoint: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameType {
    System,
    Event,
    Callback,
}

/// One JSON frame received over the stream connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFrame {
    #[serde(default)]
    pub spec_version: Option<String>,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub data: String,
}

impl StreamFrame {
    fn header(&self, name: &str) -> &str {
        self.headers.get(name).and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn topic(&self) -> &str {
        self.header("topic")
    }

    pub fn message_id(&self) -> &str {
        self.header("messageId")
    }
}

/// What the connection loop should do with a frame.
#[derive(Debug)]
pub enum FrameAction {
    /// Send this frame back and carry on.
    Reply(Value),
    /// Acknowledge, and hand the parsed message (if any) to the inbound path.
    Deliver {
        ack: Value,
        message: Option<InboundMessage>,
    },
    /// The server asked us to reconnect.
    Reconnect,
}

fn ack(frame: &StreamFrame, data: Value) -> Value {
    json!({
        "code": 200,
        "headers": {
            "contentType": "application/json",
            "messageId": frame.message_id(),
        },
        "message": "OK",
        "data": data.to_string(),
    })
}

/// Decide how to answer `frame`.
///
/// Callbacks are always acknowledged, even when their payload cannot be
/// parsed, so the platform does not redeliver them.
pub fn handle_frame(frame: &StreamFrame, reply_mode: ReplyMode) -> FrameAction {
    match frame.frame_type {
        FrameType::System => match frame.topic() {
            "disconnect" => FrameAction::Reconnect,
            topic => {
                if topic != "ping" {
                    debug!("dingtalk: system frame {topic}");
                }
                FrameAction::Reply(json!({
                    "code": 200,
                    "headers": frame.headers,
                    "message": "OK",
                    "data": frame.data,
                }))
            }
        },
        FrameType::Event => FrameAction::Deliver {
            ack: ack(frame, json!({ "status": "SUCCESS", "message": "success" })),
            message: None,
        },
        FrameType::Callback => {
            let message = if frame.topic() == CHATBOT_TOPIC {
                match serde_json::from_str::<Value>(&frame.data) {
                    Ok(data) => parse_chatbot_message(&data, reply_mode),
                    Err(e) => {
                        warn!("dingtalk: callback data is not json: {e}");
                        None
                    }
                }
            } else {
                debug!("dingtalk: ignoring callback on topic {}", frame.topic());
                None
            };
            FrameAction::Deliver {
                ack: ack(frame, json!({ "response": "OK" })),
                message,
            }
        }
    }
}

/// Keeps a Stream Mode connection up until stopped, reconnecting after a
/// fixed delay whenever it drops.
pub struct StreamClient {
    api: Arc<DingTalkApi>,
    client_id: String,
    client_secret: String,
    reply_mode: ReplyMode,
    reconnect_delay: Duration,
    connect_timeout: Duration,
    handler: Arc<InboundHandler>,
    tasks: TaskPool,
    stop: CancellationToken,
}

impl StreamClient {
    pub fn new(
        api: Arc<DingTalkApi>,
        config: &DingTalkConfig,
        handler: Arc<InboundHandler>,
        tasks: TaskPool,
        stop: CancellationToken,
    ) -> Self {
        Self {
            api,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            reply_mode: config.reply_mode,
            reconnect_delay: config.reconnect_delay(),
            connect_timeout: config.request_timeout(),
            handler,
            tasks,
            stop,
        }
    }

    /// Ask the gateway for a connection endpoint and ticket.
    pub async fn open_connection(&self) -> Result<GatewayEndpoint, DingTalkError> {
        let op = "gateway open";
        let body = json!({
            "clientId": self.client_id,
            "clientSecret": self.client_secret,
            "subscriptions": [{ "type": "CALLBACK", "topic": CHATBOT_TOPIC }],
            "ua": USER_AGENT,
        });
        let resp = self
            .api
            .client()?
            .post(self.api.url(GATEWAY_OPEN_PATH))
            .json(&body)
            .send()
            .await
            .map_err(|source| DingTalkError::Transport { op, source })?;

        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        if status != 200 {
            return Err(DingTalkError::Remote {
                op,
                status,
                body: text,
            });
        }
        serde_json::from_str(&text)
            .map_err(|e| DingTalkError::Stream(format!("invalid gateway response: {e}")))
    }

    /// Run until the stop token fires.
    pub async fn run(self) {
        info!("dingtalk: stream client starting");
        while !self.stop.is_cancelled() {
            match self.session().await {
                Ok(()) => info!("dingtalk: stream connection closed"),
                Err(e) => warn!("dingtalk: stream error: {e}"),
            }
            if self.stop.is_cancelled() {
                break;
            }
            info!(
                "dingtalk: reconnecting stream in {}s",
                self.reconnect_delay.as_secs()
            );
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        info!("dingtalk: stream client stopped");
    }

    async fn connect(&self) -> Result<GatewaySocket, DingTalkError> {
        let endpoint = self.open_connection().await?;
        let url = endpoint.url()?;
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| DingTalkError::Stream("websocket connect timed out".into()))?
            .map_err(|e| DingTalkError::Stream(format!("websocket connect failed: {e}")))?;
        Ok(ws)
    }

    async fn session(&self) -> Result<(), DingTalkError> {
        let ws = tokio::select! {
            _ = self.stop.cancelled() => return Ok(()),
            ws = self.connect() => ws?,
        };
        info!("dingtalk: stream connected");
        let (mut write, mut read) = ws.split();

        loop {
            let next = tokio::select! {
                _ = self.stop.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                next = read.next() => next,
            };

            let text = match next {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(DingTalkError::Stream(format!("websocket read failed: {e}")));
                }
            };

            let frame: StreamFrame = match serde_json::from_str(text.as_str()) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("dingtalk: unparseable stream frame: {e}");
                    continue;
                }
            };

            let reply = match handle_frame(&frame, self.reply_mode) {
                FrameAction::Reconnect => {
                    info!("dingtalk: server requested reconnect");
                    return Ok(());
                }
                FrameAction::Reply(reply) => reply,
                FrameAction::Deliver { ack, message } => {
                    if let Some(message) = message {
                        self.spawn_inbound(message);
                    }
                    ack
                }
            };

            write
                .send(Message::Text(reply.to_string().into()))
                .await
                .map_err(|e| DingTalkError::Stream(format!("websocket write failed: {e}")))?;
        }
    }

    /// Inbound handling runs detached so the socket keeps being read while a
    /// card is finished or the bus is full.
    fn spawn_inbound(&self, message: InboundMessage) {
        let handler = Arc::clone(&self.handler);
        self.tasks.spawn(async move {
            if let Err(e) = handler.on_message(message).await {
                warn!("dingtalk: failed to forward inbound message: {e}");
            }
        });
    }
}
