pub mod bus;
pub mod error;
pub mod message;

pub use bus::MessageBus;
pub use error::{Error, Result};
pub use message::{InboundMessage, Metadata, OutboundMessage};
