pub mod dingtalk;
pub mod traits;

pub use dingtalk::DingTalkChannel;
pub use traits::{ChannelLifecycle, ChannelSender, ChannelStatus};
