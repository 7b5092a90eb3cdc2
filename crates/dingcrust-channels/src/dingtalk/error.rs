use thiserror::Error;

use super::card::{CardPhase, CardStep};

/// Failures of the DingTalk HTTP protocol and the card state machine.
///
/// Card delivery is best-effort: apart from a failed card creation (which
/// sends the reply down the plain-text path) these are logged and absorbed.
#[derive(Debug, Error)]
pub enum DingTalkError {
    /// Credential exchange failed; no access token is available.
    #[error("dingtalk auth failed: {0}")]
    Auth(String),

    /// The remote API answered with a non-200 status.
    #[error("dingtalk {op} failed ({status}): {body}")]
    Remote {
        op: &'static str,
        status: u16,
        body: String,
    },

    /// The request never produced a response.
    #[error("dingtalk {op} transport error: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The shared HTTP client was released during shutdown.
    #[error("dingtalk http client is closed")]
    TransportClosed,

    /// A card lifecycle step was requested out of order.
    #[error("card step {step:?} is not allowed in phase {phase:?}")]
    Protocol { phase: CardPhase, step: CardStep },

    /// The Stream Mode gateway misbehaved.
    #[error("dingtalk stream error: {0}")]
    Stream(String),
}

impl From<DingTalkError> for dingcrust_common::Error {
    fn from(e: DingTalkError) -> Self {
        dingcrust_common::Error::Channel(e.to_string())
    }
}
