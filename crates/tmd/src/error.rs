//! Participant error types.

use thiserror::Error;

use tm_core::DomainError;
use tm_protocol::{BrokerError, RendezvousError, SubscribeError};

/// Errors that stop a participant.
///
/// Problems with individual commands never surface here; they are answered
/// with a failure status and the participant keeps listening.
#[derive(Error, Debug)]
pub enum ParticipantError {
    /// The parameter key never became readable
    #[error("Unable to fetch parameter key '{key}': {source}")]
    Params {
        key: String,
        #[source]
        source: RendezvousError,
    },

    /// The parameter document is not usable
    #[error("Invalid parameter block in '{key}': {reason}")]
    InvalidParams { key: String, reason: String },

    /// Could not listen on the command channel
    #[error("Unable to subscribe to command channel: {0}")]
    Subscribe(#[from] SubscribeError),

    /// Broker failure while listening or reporting
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Result type for participant operations.
pub type Result<T> = std::result::Result<T, ParticipantError>;
