//! Broker abstraction shared by the Redis and in-memory implementations.
//!
//! A [`Broker`] is a handle passed explicitly into every component that
//! needs it; nothing in this workspace holds a global connection.

use async_trait::async_trait;

use crate::error::{BrokerError, BrokerResult};
use crate::resp::RespValue;

/// Key/value and pub/sub operations used by the control plane.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Verifies the broker is reachable.
    async fn ping(&self) -> BrokerResult<()> {
        Ok(())
    }

    /// Reads a key; `None` when the key does not exist.
    async fn get(&self, key: &str) -> BrokerResult<Option<Vec<u8>>>;

    /// Writes a key.
    async fn set(&self, key: &str, value: &[u8]) -> BrokerResult<()>;

    /// Publishes a payload, returning how many subscribers received it.
    async fn publish(&self, channel: &str, payload: &[u8]) -> BrokerResult<u64>;

    /// Subscribes to a channel.
    ///
    /// The acknowledgement is NOT consumed: it is the first event the
    /// returned subscription delivers.
    async fn subscribe(&self, channel: &str) -> BrokerResult<Box<dyn Subscription>>;

    /// Human-readable broker location for diagnostics.
    fn endpoint(&self) -> String;
}

/// One live subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next pub/sub event.
    async fn next_event(&mut self) -> BrokerResult<PubSubEvent>;

    /// Requests removal of the subscription. The broker answers with an
    /// `unsubscribe` event.
    async fn unsubscribe(&mut self) -> BrokerResult<()>;

    /// Releases the underlying connection.
    async fn close(&mut self) -> BrokerResult<()>;
}

/// Pub/sub event type as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Subscribe,
    Unsubscribe,
    Message,
    PSubscribe,
    PUnsubscribe,
    PMessage,
    Other(String),
}

impl EventKind {
    fn from_name(name: &str) -> Self {
        match name {
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            "message" => Self::Message,
            "psubscribe" => Self::PSubscribe,
            "punsubscribe" => Self::PUnsubscribe,
            "pmessage" => Self::PMessage,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Event body: a subscription count for acks, a payload for messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventData {
    Count(i64),
    Payload(Vec<u8>),
}

/// A single event delivered on a subscription connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubEvent {
    pub kind: EventKind,
    pub pattern: Option<String>,
    pub channel: String,
    pub data: EventData,
}

impl PubSubEvent {
    /// A `subscribe` acknowledgement.
    pub fn subscribe_ack(channel: impl Into<String>, count: i64) -> Self {
        Self {
            kind: EventKind::Subscribe,
            pattern: None,
            channel: channel.into(),
            data: EventData::Count(count),
        }
    }

    /// An `unsubscribe` acknowledgement.
    pub fn unsubscribe_ack(channel: impl Into<String>, count: i64) -> Self {
        Self {
            kind: EventKind::Unsubscribe,
            pattern: None,
            channel: channel.into(),
            data: EventData::Count(count),
        }
    }

    /// A published message.
    pub fn message(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: EventKind::Message,
            pattern: None,
            channel: channel.into(),
            data: EventData::Payload(payload.into()),
        }
    }

    /// Decodes a push reply read from a subscription connection.
    ///
    /// Shapes are `[kind, channel, data]` and, for pattern messages,
    /// `[kind, pattern, channel, data]`.
    pub fn from_resp(value: RespValue) -> BrokerResult<Self> {
        let RespValue::Array(items) = value else {
            return Err(BrokerError::Protocol(format!(
                "expected pub/sub array, got {}",
                value.describe()
            )));
        };

        let mut parts = items.into_iter();
        let kind = match parts.next() {
            Some(v) => EventKind::from_name(&text(v)?),
            None => return Err(BrokerError::Protocol("empty pub/sub event".to_string())),
        };

        let pattern = if kind == EventKind::PMessage {
            parts.next().map(text).transpose()?
        } else {
            None
        };

        let channel = match parts.next() {
            Some(v) => text(v)?,
            None => return Err(BrokerError::Protocol("pub/sub event has no channel".to_string())),
        };

        let data = match parts.next() {
            Some(RespValue::Integer(n)) => EventData::Count(n),
            Some(RespValue::Bulk(b)) => EventData::Payload(b),
            Some(RespValue::Simple(s)) => EventData::Payload(s.into_bytes()),
            Some(other) => {
                return Err(BrokerError::Protocol(format!(
                    "unexpected pub/sub data {}",
                    other.describe()
                )))
            }
            None => return Err(BrokerError::Protocol("pub/sub event has no data".to_string())),
        };

        Ok(Self {
            kind,
            pattern,
            channel,
            data,
        })
    }
}

fn text(value: RespValue) -> BrokerResult<String> {
    match value {
        RespValue::Bulk(b) => Ok(String::from_utf8_lossy(&b).into_owned()),
        RespValue::Simple(s) => Ok(s),
        other => Err(BrokerError::Protocol(format!(
            "expected string, got {}",
            other.describe()
        ))),
    }
}
