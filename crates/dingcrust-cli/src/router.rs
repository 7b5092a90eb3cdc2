use std::collections::HashMap;
use std::sync::Arc;

use dingcrust_channels::ChannelSender;
use dingcrust_common::MessageBus;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Deliver everything the agent publishes through the channel's sender.
///
/// Each message is delivered on its own task so a slow conversation never
/// holds up the others. Deliveries for one chat are chained: a message waits
/// for the previous one to the same chat, keeping progress ahead of the reply.
pub async fn route_outbound(
    bus: Arc<MessageBus>,
    sender: Arc<dyn ChannelSender>,
    stop: CancellationToken,
) {
    let mut in_flight: HashMap<String, JoinHandle<()>> = HashMap::new();
    loop {
        let message = tokio::select! {
            _ = stop.cancelled() => break,
            next = bus.consume_outbound() => match next {
                Some(message) => message,
                None => break,
            },
        };
        if message.channel != sender.channel_type() {
            warn!("no sender for channel {}, dropping message", message.channel);
            continue;
        }

        in_flight.retain(|_, handle| !handle.is_finished());
        let previous = in_flight.remove(&message.chat_id);
        let chat_id = message.chat_id.clone();
        let sender = Arc::clone(&sender);
        let delivery = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if let Err(e) = sender.send_message(&message).await {
                error!("failed to deliver to {}: {e}", message.chat_id);
            }
        });
        in_flight.insert(chat_id, delivery);
    }

    for (chat_id, handle) in in_flight {
        if let Err(e) = handle.await {
            error!("delivery to {chat_id} ended abnormally: {e}");
        }
    }
}
