use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::{InboundMessage, OutboundMessage};

const BUS_CAPACITY: usize = 256;

/// In-process queue pair decoupling channels from the agent loop.
///
/// Channels publish inbound messages and consume outbound ones; the agent
/// does the opposite. Each side has a single logical consumer.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::Receiver<OutboundMessage>>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(BUS_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(BUS_CAPACITY);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
        }
    }

    pub async fn publish_inbound(&self, message: InboundMessage) -> Result<()> {
        debug!("bus: inbound from {} on {}", message.sender_id, message.channel);
        self.inbound_tx
            .send(message)
            .await
            .map_err(|e| Error::Bus(format!("inbound queue closed: {e}")))
    }

    /// Wait for the next inbound message. Returns `None` once the bus is gone.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    pub async fn publish_outbound(&self, message: OutboundMessage) -> Result<()> {
        self.outbound_tx
            .send(message)
            .await
            .map_err(|e| Error::Bus(format!("outbound queue closed: {e}")))
    }

    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        self.outbound_rx.lock().await.recv().await
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
