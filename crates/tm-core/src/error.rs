//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
///
/// Roster failures are split by cause so callers can tell a document that
/// is not JSON at all apart from one that decodes but lacks a required
/// section.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Action string is not one of the known actions
    #[error("Unrecognized action, '{action}', allowed actions are: {allowed}")]
    UnknownAction { action: String, allowed: String },

    /// Command payload does not have the expected shape
    #[error("Malformed command message: {reason}")]
    MalformedCommand { reason: String },

    /// Status payload does not have the expected shape
    #[error("Malformed status message: {reason}")]
    MalformedStatus { reason: String },

    /// Roster payload is not a decodable roster document
    #[error("Unable to decode roster: {reason}")]
    RosterMalformed { reason: String },

    /// Roster has no data sink entry
    #[error("missing data sink in roster")]
    RosterMissingDataSink,

    /// Roster has no tool meister list
    #[error("missing tool meisters in roster")]
    RosterMissingToolMeisters,

    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },

    /// Configuration file could not be read or parsed
    #[error("Invalid configuration in {path}: {reason}")]
    Config { path: String, reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
