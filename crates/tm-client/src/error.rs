//! Error types for the client coordinator.
//!
//! These are the fatal outcomes: the cycle could not start or could not
//! publish. Everything that happens after a successful publish is folded
//! into the [`CycleReport`](crate::report::CycleReport) instead.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::time::Duration;
use thiserror::Error;

use tm_core::{Action, DomainError};
use tm_protocol::{BrokerError, SubscribeError};

// ============================================================================
// Exit Codes
// ============================================================================

/// Process exit codes surfaced by the client binary.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const CYCLE_FAILED: i32 = 1;
    pub const CONNECT: i32 = 2;
    pub const ROSTER_UNAVAILABLE: i32 = 3;
    pub const ROSTER_MALFORMED: i32 = 4;
    pub const ROSTER_MISSING_DATA_SINK: i32 = 5;
    pub const ROSTER_MISSING_TOOL_MEISTERS: i32 = 6;
    pub const BAD_ACTION: i32 = 7;
    pub const ROSTER_READ: i32 = 8;
}

// ============================================================================
// Coordinator Error Type
// ============================================================================

/// Fatal coordinator errors.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Action string not recognized
    #[error(transparent)]
    UnknownAction(DomainError),

    /// Action recognized but not valid on this call path
    #[error("Action '{action}' is not allowed here")]
    ActionNotAllowed { action: Action },

    /// The broker could not be reached
    #[error("Unable to connect to broker {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: BrokerError,
    },

    /// The roster key never appeared
    #[error("Roster key \"{key}\" does not exist (waited {waited:?})")]
    RosterUnavailable { key: String, waited: Duration },

    /// The broker is reachable but refused to read the roster key
    #[error("Broker rejected read of roster key \"{key}\": {source}")]
    RosterRead {
        key: String,
        #[source]
        source: BrokerError,
    },

    /// The roster is not a decodable roster document
    #[error("Unable to fetch and decode roster: {reason}")]
    RosterMalformed { reason: String },

    /// The caller cancelled the roster wait
    #[error("Interrupted waiting for roster key \"{key}\"")]
    Interrupted { key: String },

    /// The roster has no data sink
    #[error("missing data sink in roster")]
    RosterMissingDataSink,

    /// The roster has no tool meister list
    #[error("missing tool meisters in roster")]
    RosterMissingToolMeisters,

    /// The status channel subscription could not be established
    #[error("Unable to subscribe to status channel: {0}")]
    Subscribe(#[from] SubscribeError),

    /// Broker failure while publishing
    #[error("Broker failure: {0}")]
    Broker(#[from] BrokerError),

    /// Any other domain error
    #[error(transparent)]
    Domain(DomainError),
}

impl CoordinatorError {
    /// Exit code the client binary reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UnknownAction(_) | Self::ActionNotAllowed { .. } => exit_code::BAD_ACTION,
            Self::Connect { .. } => exit_code::CONNECT,
            Self::RosterUnavailable { .. } => exit_code::ROSTER_UNAVAILABLE,
            Self::RosterRead { .. } => exit_code::ROSTER_READ,
            Self::RosterMalformed { .. } => exit_code::ROSTER_MALFORMED,
            Self::RosterMissingDataSink => exit_code::ROSTER_MISSING_DATA_SINK,
            Self::RosterMissingToolMeisters => exit_code::ROSTER_MISSING_TOOL_MEISTERS,
            Self::Interrupted { .. } | Self::Subscribe(_) | Self::Broker(_) | Self::Domain(_) => {
                exit_code::CYCLE_FAILED
            }
        }
    }
}

impl From<DomainError> for CoordinatorError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::UnknownAction { .. } => Self::UnknownAction(err),
            DomainError::RosterMalformed { reason } => Self::RosterMalformed { reason },
            DomainError::RosterMissingDataSink => Self::RosterMissingDataSink,
            DomainError::RosterMissingToolMeisters => Self::RosterMissingToolMeisters,
            other => Self::Domain(other),
        }
    }
}

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_cause() {
        let errors = [
            CoordinatorError::ActionNotAllowed {
                action: Action::Terminate,
            },
            CoordinatorError::Connect {
                endpoint: "redis://localhost:17001".into(),
                source: BrokerError::ConnectionClosed,
            },
            CoordinatorError::RosterUnavailable {
                key: "tm-pids".into(),
                waited: Duration::from_secs(5),
            },
            CoordinatorError::RosterMalformed {
                reason: "eof".into(),
            },
            CoordinatorError::RosterMissingDataSink,
            CoordinatorError::RosterMissingToolMeisters,
            CoordinatorError::RosterRead {
                key: "tm-pids".into(),
                source: BrokerError::Server("NOAUTH Authentication required.".into()),
            },
        ];
        let codes: Vec<i32> = errors.iter().map(CoordinatorError::exit_code).collect();
        assert_eq!(codes, vec![7, 2, 3, 4, 5, 6, 8]);
    }

    #[test]
    fn test_domain_roster_errors_map_to_roster_variants() {
        assert!(matches!(
            CoordinatorError::from(DomainError::RosterMissingDataSink),
            CoordinatorError::RosterMissingDataSink
        ));
        let unknown = CoordinatorError::from(DomainError::UnknownAction {
            action: "dance".into(),
            allowed: "start".into(),
        });
        assert_eq!(unknown.exit_code(), exit_code::BAD_ACTION);
        assert!(unknown.to_string().contains("'dance'"));
    }

    #[test]
    fn test_connect_display_names_endpoint() {
        let err = CoordinatorError::Connect {
            endpoint: "redis://ctl:17001".into(),
            source: BrokerError::ConnectionClosed,
        };
        assert!(err.to_string().contains("redis://ctl:17001"));
    }
}
