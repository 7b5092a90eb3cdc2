use std::fmt;

use async_trait::async_trait;
use dingcrust_common::{OutboundMessage, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle management for a messaging channel (connect, disconnect, status).
#[async_trait]
pub trait ChannelLifecycle: Send {
    /// Human-readable display name.
    fn display_name(&self) -> &str;

    /// Start the channel, connecting to the external service.
    async fn connect(&mut self) -> Result<()>;

    /// Gracefully disconnect from the external service.
    async fn disconnect(&mut self) -> Result<()>;

    /// Current connection status.
    fn status(&self) -> ChannelStatus;

    /// Create a lightweight send-only handle for this channel.
    ///
    /// The returned sender is independent of the lifecycle and can be moved
    /// into the outbound routing task while the channel runs its receive loop.
    fn create_sender(&self) -> Box<dyn ChannelSender>;
}

/// Send-only interface for delivering outbound messages through a channel.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Unique identifier for this channel type.
    fn channel_type(&self) -> &str;

    /// Deliver an agent message through this channel.
    async fn send_message(&self, message: &OutboundMessage) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error(String),
}

impl ChannelStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelStatus::Connected)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::Disconnected => f.write_str("disconnected"),
            ChannelStatus::Connecting => f.write_str("connecting"),
            ChannelStatus::Connected => f.write_str("connected"),
            ChannelStatus::Reconnecting => f.write_str("reconnecting"),
            ChannelStatus::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_is_lowercase() {
        assert_eq!(ChannelStatus::Connected.to_string(), "connected");
        assert_eq!(
            ChannelStatus::Error("gateway refused".into()).to_string(),
            "error: gateway refused"
        );
        assert!(ChannelStatus::Connected.is_connected());
        assert!(!ChannelStatus::Reconnecting.is_connected());
    }
}
