//! Waiting for a key to appear in the broker.
//!
//! Participants learn their parameters, and the client learns the roster,
//! by polling a well-known key until some other process has written it.
//! The wait survives the broker being down or restarting in the meantime.
//! Any other broker error ends it.
//!
//! Without a cancellation token the wait has no upper bound. Callers that
//! need a deadline hand in a [`CancellationToken`] and cancel it.

use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::Broker;
use crate::error::BrokerError;

/// Default pause between attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A key-missing notice is issued every this many consecutive misses.
const MISSING_NOTICE_EVERY: u64 = 10;

/// User-facing progress notices issued while waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// First attempt could not reach the broker (issued once)
    WaitingToConnect,
    /// Connection lost after having been connected
    Disconnected,
    /// Broker reachable again after a failure
    Connected,
    /// Key still absent after another batch of misses
    KeyMissing { key: String },
    /// Issued on success when more than one attempt was needed
    Summary { attempts: u64, errors: u64 },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitingToConnect => f.write_str("waiting to connect to broker"),
            Self::Disconnected => f.write_str("disconnected from broker"),
            Self::Connected => f.write_str("connected to broker"),
            Self::KeyMissing { key } => write!(f, "key '{key}' does not exist yet"),
            Self::Summary { attempts, errors } => write!(
                f,
                "connected to broker after {attempts} attempts (with {errors} error(s))"
            ),
        }
    }
}

/// Counters describing one wait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RendezvousStats {
    /// Number of `get` attempts
    pub attempts: u64,
    /// Number of attempts that failed with a broker error
    pub errors: u64,
    /// Notices issued, in order
    pub notices: Vec<Notice>,
}

/// Ways a wait can end without a value.
#[derive(thiserror::Error, Debug)]
pub enum RendezvousError {
    /// The caller's cancellation token fired first
    #[error("Gave up waiting for key '{key}' after {} attempts", stats.attempts)]
    Cancelled { key: String, stats: RendezvousStats },

    /// The key exists but its value is not UTF-8
    #[error("Value of key '{key}' is not valid UTF-8")]
    InvalidUtf8 { key: String },

    /// The broker is reachable but refused the read
    #[error("Broker rejected read of key '{key}': {source}")]
    Broker {
        key: String,
        #[source]
        source: BrokerError,
    },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Link {
    Unknown,
    Down,
    Up,
}

/// A configured wait for one key.
pub struct Rendezvous<'a> {
    broker: &'a dyn Broker,
    key: String,
    prog: String,
    poll_interval: Duration,
    cancel: Option<CancellationToken>,
}

impl<'a> Rendezvous<'a> {
    /// Prepares a wait for `key` on behalf of program `prog`.
    pub fn new(broker: &'a dyn Broker, key: impl Into<String>, prog: impl Into<String>) -> Self {
        Self {
            broker,
            key: key.into(),
            prog: prog.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel: None,
        }
    }

    /// Sets the pause between attempts.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bounds the wait with a cancellation token.
    #[must_use]
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn notify(&self, stats: &mut RendezvousStats, notice: Notice) {
        info!(prog = %self.prog, broker = %self.broker.endpoint(), "{}: {}", self.prog, notice);
        stats.notices.push(notice);
    }

    /// Polls until the key holds a value, returning it with the wait's
    /// statistics.
    pub async fn wait(self) -> Result<(String, RendezvousStats), RendezvousError> {
        let mut stats = RendezvousStats::default();
        let mut link = Link::Unknown;
        let mut missing = 0u64;

        loop {
            if self.is_cancelled() {
                return Err(self.cancelled(stats));
            }
            stats.attempts += 1;

            let reply = match &self.cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => return Err(self.cancelled(stats)),
                    reply = self.broker.get(&self.key) => reply,
                },
                None => self.broker.get(&self.key).await,
            };

            match reply {
                Err(e) if !e.is_connection_error() => {
                    return Err(RendezvousError::Broker {
                        key: self.key.clone(),
                        source: e,
                    });
                }
                Err(e) => {
                    stats.errors += 1;
                    missing = 0;
                    debug!(key = %self.key, error = %e, "Rendezvous get failed");
                    match link {
                        Link::Unknown => self.notify(&mut stats, Notice::WaitingToConnect),
                        Link::Up => self.notify(&mut stats, Notice::Disconnected),
                        Link::Down => {}
                    }
                    link = Link::Down;
                }
                Ok(value) => {
                    if link == Link::Down {
                        self.notify(&mut stats, Notice::Connected);
                    }
                    link = Link::Up;

                    if let Some(bytes) = value {
                        if stats.attempts > 1 {
                            let summary = Notice::Summary {
                                attempts: stats.attempts,
                                errors: stats.errors,
                            };
                            self.notify(&mut stats, summary);
                        }
                        let text = String::from_utf8(bytes)
                            .map_err(|_| RendezvousError::InvalidUtf8 { key: self.key.clone() })?;
                        return Ok((text, stats));
                    }

                    missing += 1;
                    if missing % MISSING_NOTICE_EVERY == 0 {
                        let notice = Notice::KeyMissing { key: self.key.clone() };
                        self.notify(&mut stats, notice);
                    }
                }
            }

            self.pause(&stats).await?;
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn cancelled(&self, stats: RendezvousStats) -> RendezvousError {
        RendezvousError::Cancelled {
            key: self.key.clone(),
            stats,
        }
    }

    async fn pause(&self, stats: &RendezvousStats) -> Result<(), RendezvousError> {
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(self.cancelled(stats.clone())),
                _ = sleep(self.poll_interval) => Ok(()),
            },
            None => {
                sleep(self.poll_interval).await;
                Ok(())
            }
        }
    }
}

/// Waits without bound for `key`, returning its value.
pub async fn wait_for_key(
    broker: &dyn Broker,
    key: &str,
    prog: &str,
) -> Result<String, RendezvousError> {
    Rendezvous::new(broker, key, prog)
        .wait()
        .await
        .map(|(value, _)| value)
}
