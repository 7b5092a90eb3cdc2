use std::sync::Arc;
use std::time::Duration;

use dingcrust_common::OutboundMessage;
use dingcrust_config::{DingTalkConfig, ReplyMode};
use tracing::{info, warn};

use super::api::DingTalkApi;
use super::card::CardLifecycle;
use super::error::DingTalkError;
use super::registry::CardRegistry;
use super::route::{CardRoute, ConversationKey};
use super::text::TextSender;

/// Routes outbound messages to the plain-text path or to an AI card, and
/// owns the eviction and interruption policy for open cards.
pub struct DeliveryDispatcher {
    reply_mode: ReplyMode,
    card_ttl: Duration,
    registry: Arc<CardRegistry>,
    lifecycle: CardLifecycle,
    text: TextSender,
}

impl DeliveryDispatcher {
    pub fn new(config: &DingTalkConfig, api: Arc<DingTalkApi>) -> Self {
        Self {
            reply_mode: config.reply_mode,
            card_ttl: config.card_ttl(),
            registry: Arc::new(CardRegistry::new()),
            lifecycle: CardLifecycle::new(
                Arc::clone(&api),
                &config.client_id,
                &config.card_template_id,
            ),
            text: TextSender::new(api, &config.client_id),
        }
    }

    pub fn with_card_ttl(mut self, ttl: Duration) -> Self {
        self.card_ttl = ttl;
        self
    }

    pub fn reply_mode(&self) -> ReplyMode {
        self.reply_mode
    }

    pub fn registry(&self) -> &Arc<CardRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &CardLifecycle {
        &self.lifecycle
    }

    /// Deliver one outbound message.
    ///
    /// Card failures are absorbed; only a failed card creation changes the
    /// outcome by sending the message as plain text instead. The returned
    /// error therefore always comes from the plain-text path.
    pub async fn deliver(&self, msg: &OutboundMessage) -> Result<(), DingTalkError> {
        let route = match (self.reply_mode, CardRoute::from_metadata(&msg.metadata)) {
            (ReplyMode::AiCard, Some(route)) => route,
            _ => return self.text.send(msg).await,
        };

        let key = route.key();
        let mut slot = self.registry.lock(&key).await;

        let expired = slot.card().is_some_and(|c| c.is_expired(self.card_ttl));
        if expired && let Some(mut stale) = slot.take() {
            warn!(
                "dingtalk: evicting card {} for {key} after {}s",
                stale.id(),
                stale.age().as_secs()
            );
            self.lifecycle.finish(&mut stale).await;
        }

        if msg.is_progress() {
            if slot.card().is_none() {
                match self.lifecycle.create(&route).await {
                    Ok(card) => {
                        slot.put(card);
                    }
                    Err(_) => {
                        drop(slot);
                        warn!("dingtalk: card unavailable for {key}, falling back to text");
                        return self.text.send(msg).await;
                    }
                }
            }
            if let Some(card) = slot.card_mut() {
                card.append(&msg.content);
                card.append("\n\n");
                let content = card.content().to_string();
                self.lifecycle.stream(card, &content, false).await;
            }
            return Ok(());
        }

        let mut card = match slot.take() {
            Some(card) => card,
            None => match self.lifecycle.create(&route).await {
                Ok(card) => card,
                Err(_) => {
                    drop(slot);
                    warn!("dingtalk: card unavailable for {key}, falling back to text");
                    return self.text.send(msg).await;
                }
            },
        };
        card.append(&msg.content);
        self.lifecycle.finish(&mut card).await;
        Ok(())
    }

    /// Finish and drop the open card for `key`, if any. Returns whether a
    /// card was finished.
    ///
    /// The slot stays locked until the card is finished, so a delivery for
    /// the same conversation cannot start a new card in between.
    pub async fn interrupt(&self, key: &ConversationKey) -> bool {
        let mut slot = self.registry.lock(key).await;
        let Some(mut card) = slot.take() else {
            return false;
        };
        info!(
            "dingtalk: new message for {key}, finishing open card {}",
            card.id()
        );
        self.lifecycle.finish(&mut card).await;
        true
    }
}
