//! Outcome of one coordination cycle.

use std::collections::BTreeMap;
use std::fmt;

use tm_core::{Action, ParticipantId, Roster};

/// Tracking-table slot for one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingEntry {
    /// PID recorded in the roster
    pub pid: u32,
    /// Status reported this cycle, if any
    pub status: Option<String>,
}

/// Per-cycle tracking table, keyed by participant.
pub type TrackingTable = BTreeMap<ParticipantId, TrackingEntry>;

/// Builds an empty tracking table from a validated roster.
pub fn tracking_table(roster: &Roster) -> TrackingTable {
    roster
        .participants()
        .map(|(id, pid)| (id, TrackingEntry { pid, status: None }))
        .collect()
}

/// One reason a cycle did not fully succeed.
///
/// These are soft failures: each is logged when observed and collection
/// carries on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum CycleFailure {
    /// Fewer (or more) subscribers received the command than the roster lists
    PublishMismatch { expected: usize, present: u64 },
    /// A participant reported something other than success
    StatusFailure { participant: String, status: String },
    /// A status payload was JSON but not a status document
    MalformedStatus { reason: String },
    /// Payloads that were not JSON at all
    NonJsonPayloads { count: u64 },
    /// A status named a host not in the roster
    UnknownHost { hostname: String },
    /// Participants that never reported
    MissingParticipants { participants: Vec<String> },
    /// The status channel failed or closed before collection finished
    ConnectionLost { reason: String },
    /// A co-resident participant did not exit in time
    LocalExitTimeout { participant: String, pid: u32 },
    /// Tearing down the broker process failed
    TransportShutdown { reason: String },
    /// The caller cancelled the cycle while it was waiting
    Interrupted { waiting_for: String },
}

impl fmt::Display for CycleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublishMismatch { expected, present } => write!(
                f,
                "published to {present} subscribers, expected {expected}"
            ),
            Self::StatusFailure {
                participant,
                status,
            } => write!(f, "{participant} reported '{status}'"),
            Self::MalformedStatus { reason } => write!(f, "malformed status: {reason}"),
            Self::NonJsonPayloads { count } => write!(f, "{count} status payload(s) were not JSON"),
            Self::UnknownHost { hostname } => write!(f, "status from untracked host {hostname}"),
            Self::MissingParticipants { participants } => {
                write!(f, "no status from {}", participants.join(", "))
            }
            Self::ConnectionLost { reason } => write!(f, "connection lost: {reason}"),
            Self::LocalExitTimeout { participant, pid } => {
                write!(f, "{participant} (pid {pid}) did not exit")
            }
            Self::TransportShutdown { reason } => write!(f, "broker shutdown failed: {reason}"),
            Self::Interrupted { waiting_for } => {
                write!(f, "interrupted waiting for {waiting_for}")
            }
        }
    }
}

/// Aggregate result of `dispatch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub action: Action,
    /// Participants the roster lists
    pub expected: usize,
    /// Subscribers the broker delivered the command to
    pub present: u64,
    /// Statuses accepted into the tracking table
    pub done_count: usize,
    pub tracking: TrackingTable,
    /// Soft failures, sorted
    pub failures: Vec<CycleFailure>,
}

impl CycleReport {
    /// Report for an action that needs no broker interaction.
    pub fn skipped(action: Action) -> Self {
        Self {
            action,
            expected: 0,
            present: 0,
            done_count: 0,
            tracking: TrackingTable::new(),
            failures: Vec::new(),
        }
    }

    /// True when every participant reported success and the publish count
    /// matched.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// True when the command reached fewer or more subscribers than listed.
    pub fn has_publish_mismatch(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f, CycleFailure::PublishMismatch { .. }))
    }
}

/// Aggregate result of `terminate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminateReport {
    pub expected: usize,
    pub present: u64,
    /// Co-resident participants that were waited on
    pub waited_for: Vec<(ParticipantId, u32)>,
    /// Whether broker teardown ran
    pub transport_stopped: bool,
    pub failures: Vec<CycleFailure>,
}

impl TerminateReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}
