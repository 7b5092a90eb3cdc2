//! DingTalk robot channel.
//!
//! Messages arrive over Stream Mode and replies go out either as markdown
//! messages or as AI cards updated in place while the agent works.

pub mod api;
pub mod card;
pub mod dispatcher;
pub mod error;
pub mod inbound;
pub mod registry;
pub mod route;
pub mod shutdown;
pub mod stream;
pub mod tasks;
pub mod text;
pub mod token;

use std::sync::Arc;

use async_trait::async_trait;
use dingcrust_common::{Error, MessageBus, OutboundMessage, Result};
use dingcrust_config::DingTalkConfig;
use dingcrust_security::Allowlist;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::traits::{ChannelLifecycle, ChannelSender, ChannelStatus};

pub use api::DingTalkApi;
pub use card::{CardLifecycle, CardPhase, CardState, CardStep};
pub use dispatcher::DeliveryDispatcher;
pub use error::DingTalkError;
pub use inbound::{CHANNEL_NAME, InboundHandler};
pub use registry::CardRegistry;
pub use route::{CardRoute, ConversationKey};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use stream::StreamClient;
pub use tasks::TaskPool;

pub struct DingTalkChannel {
    config: DingTalkConfig,
    display: String,
    status: ChannelStatus,
    bus: Arc<MessageBus>,
    api: Arc<DingTalkApi>,
    dispatcher: Arc<DeliveryDispatcher>,
    tasks: TaskPool,
    stop: Option<CancellationToken>,
    stream_handle: Option<JoinHandle<()>>,
}

impl DingTalkChannel {
    pub fn new(config: DingTalkConfig, bus: Arc<MessageBus>) -> Self {
        let api = Arc::new(
            DingTalkApi::new(
                &config.api_base_url,
                &config.client_id,
                &config.client_secret,
            )
            .with_timeout(config.request_timeout()),
        );
        let dispatcher = Arc::new(DeliveryDispatcher::new(&config, Arc::clone(&api)));
        Self {
            config,
            display: "DingTalk".to_string(),
            status: ChannelStatus::Disconnected,
            bus,
            api,
            dispatcher,
            tasks: TaskPool::new(),
            stop: None,
            stream_handle: None,
        }
    }

    pub fn dispatcher(&self) -> &Arc<DeliveryDispatcher> {
        &self.dispatcher
    }

    pub fn inbound_handler(&self) -> InboundHandler {
        InboundHandler::new(
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.bus),
            Allowlist::new(self.config.allow_from.iter().cloned()),
        )
    }

    /// Stop receiving, finish open cards and release the HTTP client.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
        if let Some(handle) = self.stream_handle.take()
            && let Err(e) = handle.await
        {
            warn!("dingtalk: stream task ended abnormally: {e}");
        }

        let coordinator = ShutdownCoordinator::new(
            Arc::clone(&self.dispatcher),
            self.tasks.clone(),
            self.config.shutdown_timeout(),
        );
        let report = coordinator.shutdown().await;
        self.status = ChannelStatus::Disconnected;
        report
    }
}

#[async_trait]
impl ChannelLifecycle for DingTalkChannel {
    fn display_name(&self) -> &str {
        &self.display
    }

    async fn connect(&mut self) -> Result<()> {
        self.config.validate()?;
        if self.stream_handle.is_some() {
            return Err(Error::Channel("dingtalk: already connected".into()));
        }
        self.status = ChannelStatus::Connecting;

        self.api.reopen();
        if self.tasks.is_cancelled() {
            self.tasks = TaskPool::new();
        }

        let stop = CancellationToken::new();
        let client = StreamClient::new(
            Arc::clone(&self.api),
            &self.config,
            Arc::new(self.inbound_handler()),
            self.tasks.clone(),
            stop.clone(),
        );
        self.stream_handle = Some(tokio::spawn(client.run()));
        self.stop = Some(stop);

        info!(
            "dingtalk: channel started (client {}, reply_mode={:?})",
            self.config.client_id, self.config.reply_mode
        );
        self.status = ChannelStatus::Connected;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let report = self.shutdown().await;
        info!(
            "dingtalk: disconnected ({} card(s) finished{})",
            report.open_cards,
            if report.timed_out { ", timed out" } else { "" }
        );
        Ok(())
    }

    fn status(&self) -> ChannelStatus {
        self.status.clone()
    }

    fn create_sender(&self) -> Box<dyn ChannelSender> {
        Box::new(DingTalkSender {
            dispatcher: Arc::clone(&self.dispatcher),
        })
    }
}

#[async_trait]
impl ChannelSender for DingTalkChannel {
    fn channel_type(&self) -> &str {
        CHANNEL_NAME
    }

    async fn send_message(&self, message: &OutboundMessage) -> Result<()> {
        self.dispatcher.deliver(message).await.map_err(Error::from)
    }
}

/// Send-only handle for the outbound routing task.
pub struct DingTalkSender {
    dispatcher: Arc<DeliveryDispatcher>,
}

#[async_trait]
impl ChannelSender for DingTalkSender {
    fn channel_type(&self) -> &str {
        CHANNEL_NAME
    }

    async fn send_message(&self, message: &OutboundMessage) -> Result<()> {
        self.dispatcher.deliver(message).await.map_err(Error::from)
    }
}
