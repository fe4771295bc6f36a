//! The command loop shared by every protocol participant.
//!
//! # Loop
//!
//! ```text
//!  subscribe command channel (OneOfMany)
//!      │
//!      ▼
//!  ┌──────────────────────────────┐
//!  │ next JSON payload            │◄──────────────────────┐
//!  └──────┬───────────────────────┘                       │
//!         │ invalid keys / action / group                 │
//!         ├──────────────────────► failure status ────────┤
//!         │ valid                                         │
//!         ▼                                               │
//!  handler.handle(command) ── Reply::Status ─► publish ───┘
//!         │
//!         └─ Reply::Exit (terminate) ─► unsubscribe, close
//! ```
//!
//! Every command that reaches the loop is answered with exactly one status
//! on the status channel, except `terminate`, which ends the loop silently.
//! One command is handled at a time.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tm_core::{ChannelNames, CommandMessage, DomainError, Kind, StatusMessage};
use tm_protocol::{Broker, ChannelSubscriber, ChannelType, SUBSCRIBE_MAX_WAIT};

use crate::error::Result;

/// What a handler wants the loop to do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Publish this status text and keep listening
    Status(String),
    /// Stop listening without a status
    Exit,
}

/// Acts on validated commands.
#[async_trait]
pub trait CommandHandler: Send {
    async fn handle(&mut self, command: &CommandMessage) -> Reply;
}

/// Counters for one run of the loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopSummary {
    /// Commands passed to the handler and answered
    pub handled: usize,
    /// Commands answered with a validation failure
    pub rejected: usize,
    /// Statuses the broker did not deliver to exactly one subscriber
    pub unconfirmed: usize,
    /// The loop ended on `terminate`
    pub terminated: bool,
}

/// Listens on the command channel on behalf of one participant.
pub struct CommandLoop {
    broker: Arc<dyn Broker>,
    channels: ChannelNames,
    kind: Kind,
    hostname: String,
    group: Option<String>,
    subscribe_max_wait: Duration,
    cancel_token: CancellationToken,
}

impl CommandLoop {
    /// Creates a loop reporting as `kind` from `hostname`.
    pub fn new(
        broker: Arc<dyn Broker>,
        channels: ChannelNames,
        kind: Kind,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            channels,
            kind,
            hostname: hostname.into(),
            group: None,
            subscribe_max_wait: SUBSCRIBE_MAX_WAIT,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Only accept commands for this tool group (or for any group).
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    #[must_use]
    pub fn subscribe_max_wait(mut self, max_wait: Duration) -> Self {
        self.subscribe_max_wait = max_wait;
        self
    }

    /// Cancelling this token ends the loop between commands.
    #[must_use]
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Runs until `terminate`, cancellation, or the broker closing the
    /// channel.
    pub async fn run<H: CommandHandler + ?Sized>(&self, handler: &mut H) -> Result<LoopSummary> {
        let mut channel = ChannelSubscriber::subscribe_within(
            self.broker.as_ref(),
            &self.channels.command,
            ChannelType::OneOfMany,
            self.subscribe_max_wait,
        )
        .await?;
        info!(
            hostname = %self.hostname,
            channel = %self.channels.command,
            "Listening for commands"
        );

        let mut summary = LoopSummary::default();
        let outcome = self.serve(&mut channel, handler, &mut summary).await;

        if let Err(e) = channel.unsubscribe().await {
            debug!(error = %e, "Error unsubscribing from command channel");
        }
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Error closing command channel");
        }
        outcome.map(|()| summary)
    }

    async fn serve<H: CommandHandler + ?Sized>(
        &self,
        channel: &mut ChannelSubscriber,
        handler: &mut H,
        summary: &mut LoopSummary,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!(hostname = %self.hostname, "Shutdown requested, leaving command loop");
                    return Ok(());
                }
                next = channel.next_json() => next?,
            };
            let Some(value) = next else {
                warn!(hostname = %self.hostname, "Command channel closed by broker");
                return Ok(());
            };

            let command = match self.validate(value) {
                Ok(command) => command,
                Err(reason) => {
                    warn!(hostname = %self.hostname, "{reason}");
                    summary.rejected += 1;
                    if !self.report(&reason).await {
                        summary.unconfirmed += 1;
                    }
                    continue;
                }
            };
            debug!(hostname = %self.hostname, action = %command.action, "Received command");

            match handler.handle(&command).await {
                Reply::Exit => {
                    info!(hostname = %self.hostname, "Terminating");
                    summary.terminated = true;
                    return Ok(());
                }
                Reply::Status(status) => {
                    summary.handled += 1;
                    if !self.report(&status).await {
                        summary.unconfirmed += 1;
                    }
                }
            }
        }
    }

    /// Checks keys, action and group. The error is the failure status text.
    fn validate(&self, value: Value) -> std::result::Result<CommandMessage, String> {
        let raw = value.to_string();
        let command = CommandMessage::from_value(value).map_err(|e| match e {
            DomainError::MalformedCommand { reason } => reason,
            other => other.to_string(),
        })?;
        match (&command.group, &self.group) {
            (Some(theirs), Some(ours)) if theirs != ours => Err(format!(
                "unrecognized group in data of payload in message, {raw}"
            )),
            _ => Ok(command),
        }
    }

    /// Publishes one status. Returns whether exactly one subscriber got it.
    async fn report(&self, status: &str) -> bool {
        let message = StatusMessage::new(self.kind, self.hostname.as_str(), status);
        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Unable to encode status message");
                return false;
            }
        };

        match self
            .broker
            .publish(&self.channels.status, payload.as_bytes())
            .await
        {
            Ok(1) => {
                debug!(channel = %self.channels.status, %payload, "Posted status message");
                true
            }
            Ok(present) => {
                error!(%payload, present, "Status message received by {present} subscribers");
                false
            }
            Err(e) => {
                error!(%payload, error = %e, "Failed to publish status message");
                false
            }
        }
    }
}
