//! Client coordinator: one command out, one status back per participant.
//!
//! # Cycle
//!
//! ```text
//!  dispatch(action, group, directory)
//!      │
//!      ├─ ping broker ─────────────────────────── Connect error
//!      ├─ wait for roster key (bounded) ───────── RosterUnavailable
//!      ├─ decode + validate roster ────────────── RosterMalformed / Missing*
//!      ├─ subscribe status channel (OnlyOne)
//!      ├─ publish command, note live count ─────┐
//!      │                                        │ count != expected
//!      │                                        ▼
//!      ├─ drain statuses ◄──────────── PublishMismatch (keep draining)
//!      │    until done == min(expected, present),
//!      │    the channel ends, or the cancel token fires
//!      └─ unsubscribe + close (errors ignored) ─► CycleReport
//! ```
//!
//! Message-level problems (non-JSON payloads, malformed statuses, unknown
//! hosts, non-success statuses) never stop the drain; they are recorded
//! as [`CycleFailure`]s and reported together at the end.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tm_core::{
    Action, ChannelNames, CommandMessage, ParticipantId, Roster, RosterDocument, StatusMessage,
    TmConfig,
};
use tm_protocol::{Broker, ChannelSubscriber, ChannelType, Rendezvous, RendezvousError};

use crate::error::{CoordinatorError, Result};
use crate::process::{ProcessControl, SystemProcesses};
use crate::report::{tracking_table, CycleFailure, CycleReport, TerminateReport, TrackingTable};
use crate::shutdown::{NoTransportShutdown, ShutdownTransport};

// ============================================================================
// Configuration
// ============================================================================

/// Default pause between roster polls.
pub const DEFAULT_ROSTER_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default interval between local liveness probes.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_millis(100);

/// Default retry window for subscribing to the status channel.
pub const DEFAULT_SUBSCRIBE_MAX_WAIT: Duration = Duration::from_secs(60);

/// Settings for one coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Command and status channel names
    pub channels: ChannelNames,

    /// Key holding the roster
    pub roster_key: String,

    /// How long to wait for the roster key to appear
    pub roster_timeout: Duration,

    /// Pause between roster polls
    pub roster_poll_interval: Duration,

    /// Retry window for connection failures while subscribing
    pub subscribe_max_wait: Duration,

    /// This host's full hostname; Tool Meisters recorded under it are local
    pub local_hostname: String,

    /// Interval between local liveness probes on terminate
    pub liveness_interval: Duration,

    /// Bound on waiting for each local participant to exit (`None` = wait forever)
    pub local_exit_timeout: Option<Duration>,

    /// Program name used in user-facing notices
    pub prog: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_tm_config(&TmConfig::default())
    }
}

impl CoordinatorConfig {
    /// Derives coordinator settings from the shared configuration.
    pub fn from_tm_config(config: &TmConfig) -> Self {
        Self {
            channels: config.channels(),
            roster_key: config.roster_key.clone(),
            roster_timeout: config.roster_timeout(),
            roster_poll_interval: DEFAULT_ROSTER_POLL_INTERVAL,
            subscribe_max_wait: DEFAULT_SUBSCRIBE_MAX_WAIT,
            local_hostname: config.resolved_hostname(),
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            local_exit_timeout: None,
            prog: "tm-client".to_string(),
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Orchestrates command cycles against the participants in the roster.
pub struct Coordinator {
    broker: Arc<dyn Broker>,
    config: CoordinatorConfig,
    processes: Arc<dyn ProcessControl>,
    transport: Box<dyn ShutdownTransport>,
    cancel_token: CancellationToken,
}

impl Coordinator {
    /// Creates a coordinator over an already constructed broker handle.
    ///
    /// Local processes are probed with `kill(2)` and the broker is left
    /// running on terminate until a transport is supplied.
    pub fn new(broker: Arc<dyn Broker>, config: CoordinatorConfig) -> Self {
        Self {
            broker,
            config,
            processes: Arc::new(SystemProcesses),
            transport: Box::new(NoTransportShutdown),
            cancel_token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_processes(mut self, processes: Arc<dyn ProcessControl>) -> Self {
        self.processes = processes;
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Box<dyn ShutdownTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Cancelling this token abandons whatever the coordinator is waiting
    /// on: the roster key, outstanding statuses, or local exits.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Publishes `action` to every participant and collects their statuses.
    ///
    /// `kill` succeeds without touching the broker. `terminate` is refused
    /// here; use [`terminate`](Self::terminate).
    pub async fn dispatch(
        &self,
        action: Action,
        group: Option<&str>,
        directory: Option<&str>,
    ) -> Result<CycleReport> {
        match action {
            Action::Terminate => return Err(CoordinatorError::ActionNotAllowed { action }),
            Action::Kill => {
                info!("kill requested; forceful shutdown is not implemented, nothing to do");
                return Ok(CycleReport::skipped(action));
            }
            _ => {}
        }

        self.ensure_connected().await?;
        let roster = self.fetch_roster().await?.validate()?;
        let expected = roster.expected_count();
        debug!(expected, "Roster validated");

        let mut status_channel = ChannelSubscriber::subscribe_within(
            self.broker.as_ref(),
            &self.config.channels.status,
            ChannelType::OnlyOne,
            self.config.subscribe_max_wait,
        )
        .await?;

        let command = CommandMessage::new(
            action,
            group.map(str::to_string),
            directory.map(str::to_string),
        );
        let payload = command.to_json()?;

        let present = match self
            .broker
            .publish(&self.config.channels.command, payload.as_bytes())
            .await
        {
            Ok(present) => present,
            Err(e) => {
                error!(error = %e, "Failed to publish command");
                release(&mut status_channel).await;
                return Err(e.into());
            }
        };
        debug!(%action, present, "Published command");

        let mut collector = Collector::new(&roster);
        if present != expected as u64 {
            error!(
                expected,
                present, "Failed to publish to every participant, only encountered {present} on the channel"
            );
            collector.fail(CycleFailure::PublishMismatch { expected, present });
        }

        let target = expected.min(usize::try_from(present).unwrap_or(usize::MAX));
        collector
            .drain(&mut status_channel, target, &self.cancel_token)
            .await;
        release(&mut status_channel).await;

        let report = collector.finish(action, expected, present);
        if report.is_success() {
            info!(%action, done = report.done_count, "All participants reported success");
        } else {
            warn!(%action, failures = report.failures.len(), "Cycle completed with failures");
        }
        Ok(report)
    }

    /// Tells every participant to exit, waits for the local ones, and then
    /// tears down the broker.
    ///
    /// No statuses are read. Remote participants are trusted to exit on
    /// their own.
    pub async fn terminate(&self) -> Result<TerminateReport> {
        self.ensure_connected().await?;
        let roster = self.fetch_roster().await?;
        let expected = roster.listed_count();

        let mut failures = Vec::new();
        let payload = CommandMessage::terminate().to_json()?;
        let mut present = 0;
        match self
            .broker
            .publish(&self.config.channels.command, payload.as_bytes())
            .await
        {
            Ok(count) => {
                present = count;
                if count != expected as u64 {
                    error!(
                        expected,
                        present = count,
                        "Failed to terminate every participant, only encountered {count} on the channel"
                    );
                    failures.push(CycleFailure::PublishMismatch {
                        expected,
                        present: count,
                    });
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to publish terminate message");
                failures.push(CycleFailure::ConnectionLost {
                    reason: e.to_string(),
                });
            }
        }

        let local = self.local_participants(&roster);
        for (id, pid) in &local {
            debug!(participant = %id, pid, "Waiting for local participant to exit");
            match self.wait_for_exit(*pid).await {
                ExitWait::Exited => {}
                ExitWait::TimedOut => {
                    warn!(participant = %id, pid, "Local participant did not exit in time");
                    failures.push(CycleFailure::LocalExitTimeout {
                        participant: id.to_string(),
                        pid: *pid,
                    });
                }
                ExitWait::Interrupted => {
                    warn!(
                        participant = %id,
                        pid, "Interrupted waiting for local participant to exit"
                    );
                    failures.push(CycleFailure::Interrupted {
                        waiting_for: format!("{id} (pid {pid}) to exit"),
                    });
                    break;
                }
            }
        }

        let mut transport_stopped = false;
        if failures.is_empty() {
            match self.transport.shutdown().await {
                Ok(stopped) => transport_stopped = stopped,
                Err(e) => {
                    error!(error = %e, "Exception encountered terminating broker");
                    failures.push(CycleFailure::TransportShutdown {
                        reason: e.to_string(),
                    });
                }
            }
        }

        failures.sort();
        Ok(TerminateReport {
            expected,
            present,
            waited_for: local,
            transport_stopped,
            failures,
        })
    }

    async fn ensure_connected(&self) -> Result<()> {
        self.broker
            .ping()
            .await
            .map_err(|source| CoordinatorError::Connect {
                endpoint: self.broker.endpoint(),
                source,
            })
    }

    /// Waits for the roster key, bounded by the roster timeout.
    async fn fetch_roster(&self) -> Result<RosterDocument> {
        let token = self.cancel_token.child_token();
        let deadline = token.clone();
        let timeout = self.config.roster_timeout;
        let timer = tokio::spawn(async move {
            sleep(timeout).await;
            deadline.cancel();
        });

        let result = Rendezvous::new(
            self.broker.as_ref(),
            self.config.roster_key.as_str(),
            self.config.prog.as_str(),
        )
        .poll_interval(self.config.roster_poll_interval)
        .cancel_token(token)
        .wait()
        .await;
        timer.abort();

        match result {
            Ok((raw, _stats)) => Ok(RosterDocument::parse(&raw)?),
            Err(RendezvousError::Cancelled { key, stats }) if self.cancel_token.is_cancelled() => {
                warn!(key = %key, attempts = stats.attempts, "Interrupted waiting for roster key");
                Err(CoordinatorError::Interrupted { key })
            }
            Err(RendezvousError::Cancelled { key, stats }) => {
                error!(key = %key, attempts = stats.attempts, "Roster key does not exist");
                Err(CoordinatorError::RosterUnavailable {
                    key,
                    waited: timeout,
                })
            }
            Err(e @ RendezvousError::InvalidUtf8 { .. }) => Err(CoordinatorError::RosterMalformed {
                reason: e.to_string(),
            }),
            Err(RendezvousError::Broker { key, source }) => {
                error!(key = %key, error = %source, "Broker rejected roster read");
                Err(CoordinatorError::RosterRead { key, source })
            }
        }
    }

    /// The data sink (always co-resident with the client) and any Tool
    /// Meister recorded under this host's name.
    fn local_participants(&self, roster: &RosterDocument) -> Vec<(ParticipantId, u32)> {
        let mut local = Vec::new();
        if let Some(ds) = &roster.ds {
            local.push((ParticipantId::DataSink, ds.pid));
        }
        if let Some(tms) = &roster.tm {
            local.extend(
                tms.iter()
                    .filter(|tm| tm.hostname == self.config.local_hostname)
                    .map(|tm| (ParticipantId::ToolMeister(tm.hostname.clone()), tm.pid)),
            );
        }
        local
    }

    /// Polls until `pid` is gone, the exit timeout runs out, or the cancel
    /// token fires.
    async fn wait_for_exit(&self, pid: u32) -> ExitWait {
        let started = Instant::now();
        while self.processes.is_running(pid) {
            if let Some(limit) = self.config.local_exit_timeout {
                if started.elapsed() >= limit {
                    return ExitWait::TimedOut;
                }
            }
            tokio::select! {
                _ = self.cancel_token.cancelled() => return ExitWait::Interrupted,
                _ = sleep(self.config.liveness_interval) => {}
            }
        }
        ExitWait::Exited
    }
}

/// How waiting for one local participant ended.
enum ExitWait {
    Exited,
    TimedOut,
    Interrupted,
}

/// Unsubscribes and closes, logging rather than failing.
async fn release(channel: &mut ChannelSubscriber) {
    if let Err(e) = channel.unsubscribe().await {
        debug!(error = %e, "Error unsubscribing from status channel");
    }
    if let Err(e) = channel.close().await {
        debug!(error = %e, "Error closing status channel");
    }
}

// ============================================================================
// Status Collection
// ============================================================================

/// Mutable state of one drain.
struct Collector {
    tracking: TrackingTable,
    done_count: usize,
    failures: Vec<CycleFailure>,
}

impl Collector {
    fn new(roster: &Roster) -> Self {
        Self {
            tracking: tracking_table(roster),
            done_count: 0,
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, failure: CycleFailure) {
        self.failures.push(failure);
    }

    async fn drain(
        &mut self,
        channel: &mut ChannelSubscriber,
        target: usize,
        cancel: &CancellationToken,
    ) {
        while self.done_count < target {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(
                        done = self.done_count,
                        target, "Interrupted waiting for status reports"
                    );
                    self.fail(CycleFailure::Interrupted {
                        waiting_for: "status reports".to_string(),
                    });
                    break;
                }
                next = channel.next_json() => next,
            };
            match next {
                Ok(Some(value)) => self.accept(value),
                Ok(None) => {
                    let reason = if channel.connection_closed() {
                        "broker closed the status channel"
                    } else {
                        "status channel ended"
                    };
                    error!(
                        done = self.done_count,
                        target, "{reason} before every status arrived"
                    );
                    self.fail(CycleFailure::ConnectionLost {
                        reason: reason.to_string(),
                    });
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Error encountered waiting for status reports");
                    self.fail(CycleFailure::ConnectionLost {
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }

        let skipped = channel.skipped_non_json();
        if skipped > 0 {
            self.fail(CycleFailure::NonJsonPayloads { count: skipped });
        }
    }

    /// Records one decoded status document.
    fn accept(&mut self, value: Value) {
        let status = match StatusMessage::from_value(value) {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "Unrecognized status payload");
                self.fail(CycleFailure::MalformedStatus {
                    reason: e.to_string(),
                });
                return;
            }
        };

        let id = if status.kind.is_data_sink() {
            ParticipantId::DataSink
        } else {
            ParticipantId::ToolMeister(status.hostname.clone())
        };

        let Some(entry) = self.tracking.get_mut(&id) else {
            warn!(hostname = %status.hostname, "Encountered hostname not being tracked");
            self.fail(CycleFailure::UnknownHost {
                hostname: status.hostname,
            });
            return;
        };

        if let Some(previous) = &entry.status {
            warn!(participant = %id, previous = %previous, "Duplicate status ignored");
            return;
        }

        if !status.is_success() {
            warn!(participant = %id, status = %status.status, "Status message not successful");
            self.failures.push(CycleFailure::StatusFailure {
                participant: id.to_string(),
                status: status.status.clone(),
            });
        }
        entry.status = Some(status.status);
        self.done_count += 1;
    }

    fn finish(mut self, action: Action, expected: usize, present: u64) -> CycleReport {
        let missing: BTreeSet<String> = self
            .tracking
            .iter()
            .filter(|(_, entry)| entry.status.is_none())
            .map(|(id, _)| id.to_string())
            .collect();
        if !missing.is_empty() {
            self.failures.push(CycleFailure::MissingParticipants {
                participants: missing.into_iter().collect(),
            });
        }
        self.failures.sort();

        CycleReport {
            action,
            expected,
            present,
            done_count: self.done_count,
            tracking: self.tracking,
            failures: self.failures,
        }
    }
}
