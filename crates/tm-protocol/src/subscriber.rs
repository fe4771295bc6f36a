//! Validated channel subscriptions.
//!
//! [`ChannelSubscriber`] does not hand control back until the broker has
//! acknowledged the subscription with exactly the expected channel and
//! subscriber count. After that it yields decoded payloads one at a time.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::broker::{Broker, EventData, EventKind, PubSubEvent, Subscription};
use crate::error::{AckMismatch, BrokerError, BrokerResult, SubscribeError};

/// How long connection failures while subscribing are retried.
pub const SUBSCRIBE_MAX_WAIT: Duration = Duration::from_secs(60);

/// Sleep between subscribe attempts.
pub const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Subscriber count the acknowledgement must report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Exactly one subscriber (point-to-point)
    OnlyOne,
    /// At least one subscriber (fan-out)
    OneOfMany,
}

impl ChannelType {
    fn accepts(self, count: i64) -> bool {
        match self {
            Self::OnlyOne => count == 1,
            Self::OneOfMany => count >= 1,
        }
    }
}

/// A live, validated subscription to one channel.
pub struct ChannelSubscriber {
    channel: String,
    subscription: Option<Box<dyn Subscription>>,
    unsubscribed: bool,
    closed_by_broker: bool,
    skipped_non_json: u64,
}

impl std::fmt::Debug for ChannelSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSubscriber")
            .field("channel", &self.channel)
            .field("open", &self.subscription.is_some())
            .field("unsubscribed", &self.unsubscribed)
            .field("closed_by_broker", &self.closed_by_broker)
            .finish()
    }
}

impl ChannelSubscriber {
    /// Subscribes with the default 60 second connection retry window.
    pub async fn subscribe(
        broker: &dyn Broker,
        channel: &str,
        channel_type: ChannelType,
    ) -> Result<Self, SubscribeError> {
        Self::subscribe_within(broker, channel, channel_type, SUBSCRIBE_MAX_WAIT).await
    }

    /// Subscribes, retrying connection failures for up to `max_wait`.
    ///
    /// The broker's acknowledgement is consumed and checked, in order:
    /// event type, pattern, channel name, subscriber count. A mismatch
    /// closes the subscription and returns [`SubscribeError::BadAck`].
    pub async fn subscribe_within(
        broker: &dyn Broker,
        channel: &str,
        channel_type: ChannelType,
        max_wait: Duration,
    ) -> Result<Self, SubscribeError> {
        let started = Instant::now();

        let (mut subscription, ack) = loop {
            match subscribe_and_ack(broker, channel).await {
                Ok(pair) => break pair,
                Err(e) if e.is_connection_error() && started.elapsed() < max_wait => {
                    debug!(channel, error = %e, "Subscribe failed, retrying");
                    sleep(SUBSCRIBE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        if let Err(reason) = check_ack(&ack, channel, channel_type) {
            if let Err(e) = subscription.close().await {
                debug!(channel, error = %e, "Error closing rejected subscription");
            }
            return Err(SubscribeError::BadAck {
                channel: channel.to_string(),
                reason,
                expected: channel_type,
                event: ack,
            });
        }

        debug!(channel, ?channel_type, "Subscription acknowledged");
        Ok(Self {
            channel: channel.to_string(),
            subscription: Some(subscription),
            unsubscribed: false,
            closed_by_broker: false,
            skipped_non_json: 0,
        })
    }

    /// Channel this subscriber listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// True once the broker closed the connection under this subscriber.
    pub fn connection_closed(&self) -> bool {
        self.closed_by_broker
    }

    /// Number of payloads [`next_json`](Self::next_json) skipped as not JSON.
    pub fn skipped_non_json(&self) -> u64 {
        self.skipped_non_json
    }

    /// Waits for the next payload published on the channel.
    ///
    /// Returns `Ok(None)` when the sequence ends: after an `unsubscribe`
    /// event, or when the broker closed the connection. Messages for other
    /// channels, other event types, and payloads that are not UTF-8 are
    /// logged and skipped. Other broker errors are returned.
    pub async fn next_message(&mut self) -> BrokerResult<Option<String>> {
        loop {
            if self.unsubscribed {
                return Ok(None);
            }
            let Some(subscription) = self.subscription.as_mut() else {
                return Ok(None);
            };

            let event = match subscription.next_event().await {
                Ok(event) => event,
                Err(BrokerError::ConnectionClosed) => {
                    info!(channel = %self.channel, "Broker closed the connection, ending subscription");
                    self.closed_by_broker = true;
                    self.subscription = None;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            if event.channel != self.channel {
                warn!(
                    channel = %self.channel,
                    received = %event.channel,
                    "Message for another channel, skipping"
                );
                continue;
            }

            match event.kind {
                EventKind::Message => {}
                EventKind::Unsubscribe => {
                    debug!(channel = %self.channel, "Unsubscribed, ending message sequence");
                    self.unsubscribed = true;
                    return Ok(None);
                }
                other => {
                    debug!(channel = %self.channel, kind = ?other, "Non-message event, skipping");
                    continue;
                }
            }

            let EventData::Payload(bytes) = event.data else {
                warn!(channel = %self.channel, "Message without payload, skipping");
                continue;
            };

            match String::from_utf8(bytes) {
                Ok(text) => return Ok(Some(text)),
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "Payload is not UTF-8, skipping");
                }
            }
        }
    }

    /// Waits for the next payload that parses as JSON.
    ///
    /// Payloads that fail to parse are logged, counted in
    /// [`skipped_non_json`](Self::skipped_non_json) and skipped.
    pub async fn next_json(&mut self) -> BrokerResult<Option<Value>> {
        while let Some(raw) = self.next_message().await? {
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => {
                    self.skipped_non_json += 1;
                    warn!(channel = %self.channel, payload = %raw, error = %e, "Payload is not JSON, skipping");
                }
            }
        }
        Ok(None)
    }

    /// Asks the broker to drop the subscription. Safe to call repeatedly
    /// and after the broker closed the connection.
    pub async fn unsubscribe(&mut self) -> BrokerResult<()> {
        if self.unsubscribed {
            return Ok(());
        }
        let Some(subscription) = self.subscription.as_mut() else {
            return Ok(());
        };
        match subscription.unsubscribe().await {
            Ok(()) => {
                self.unsubscribed = true;
                Ok(())
            }
            Err(BrokerError::ConnectionClosed) => {
                self.subscription = None;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Releases the subscription's connection. Safe to call repeatedly.
    pub async fn close(&mut self) -> BrokerResult<()> {
        match self.subscription.take() {
            Some(mut subscription) => match subscription.close().await {
                Err(BrokerError::ConnectionClosed) => Ok(()),
                other => other,
            },
            None => Ok(()),
        }
    }
}

async fn subscribe_and_ack(
    broker: &dyn Broker,
    channel: &str,
) -> BrokerResult<(Box<dyn Subscription>, PubSubEvent)> {
    let mut subscription = broker.subscribe(channel).await?;
    let ack = subscription.next_event().await?;
    Ok((subscription, ack))
}

fn check_ack(
    ack: &PubSubEvent,
    channel: &str,
    channel_type: ChannelType,
) -> Result<(), AckMismatch> {
    if ack.kind != EventKind::Subscribe {
        return Err(AckMismatch::Type);
    }
    if ack.pattern.is_some() {
        return Err(AckMismatch::Pattern);
    }
    if ack.channel != channel {
        return Err(AckMismatch::Channel);
    }
    match ack.data {
        EventData::Count(n) if channel_type.accepts(n) => Ok(()),
        _ => Err(AckMismatch::Count),
    }
}
