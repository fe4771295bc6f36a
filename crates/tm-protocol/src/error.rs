//! Error types for the broker layer.

use std::io;
use thiserror::Error;

use crate::broker::PubSubEvent;
use crate::subscriber::ChannelType;

/// Errors talking to the broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The broker closed the connection.
    ///
    /// Subscribers treat this as the end of the message sequence rather
    /// than as a failure.
    #[error("Connection closed by server")]
    ConnectionClosed,

    /// Socket-level failure (refused, reset, unreachable, ...)
    #[error("Broker I/O error: {0}")]
    Io(#[from] io::Error),

    /// The broker answered with an error reply
    #[error("Broker error reply: {0}")]
    Server(String),

    /// The broker sent something that is not valid for the request
    #[error("Broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Returns true for failures of the connection itself.
    ///
    /// These are the errors callers retry on. A `LOADING` reply from a server
    /// still reading its dataset counts as one; other server replies and
    /// protocol violations do not.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::Io(_) => true,
            Self::Server(message) => message.starts_with("LOADING"),
            Self::Protocol(_) => false,
        }
    }
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Which check a subscription acknowledgement failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMismatch {
    /// Event type was not `subscribe`
    Type,
    /// A pattern was set
    Pattern,
    /// Acknowledged channel differs from the requested one
    Channel,
    /// Subscription count does not satisfy the channel type
    Count,
}

/// Errors establishing a validated channel subscription.
#[derive(Error, Debug)]
pub enum SubscribeError {
    /// The broker's acknowledgement did not match what was requested
    #[error("Bad subscription acknowledgement on {channel} ({reason:?}, expected {expected:?}): {event:?}")]
    BadAck {
        channel: String,
        reason: AckMismatch,
        expected: ChannelType,
        event: PubSubEvent,
    },

    /// The broker could not be reached within the subscribe window
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
