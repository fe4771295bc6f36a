//! Command and status payloads exchanged over the broker.
//!
//! Both payloads are JSON documents. Commands flow from the client to every
//! participant on the command channel; statuses flow back from each
//! participant on the client-status channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::Action;
use crate::error::{DomainError, DomainResult};

/// The only status value treated as a success.
pub const STATUS_SUCCESS: &str = "success";

/// Keys a command payload must carry, no more and no less.
const COMMAND_KEYS: [&str; 3] = ["action", "directory", "group"];

/// A command published to all participants.
///
/// ```json
/// {"action": "start", "group": "default", "directory": "/run/tools-default"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Action to perform
    pub action: Action,

    /// Tool group the action applies to (`None` = any group)
    pub group: Option<String>,

    /// Result directory for the action
    pub directory: Option<String>,
}

impl CommandMessage {
    /// Creates a new command message.
    pub fn new(action: Action, group: Option<String>, directory: Option<String>) -> Self {
        Self {
            action,
            group,
            directory,
        }
    }

    /// Creates the terminate command (no group, no directory).
    pub fn terminate() -> Self {
        Self::new(Action::Terminate, None, None)
    }

    /// Serializes the command to its JSON wire form.
    pub fn to_json(&self) -> DomainResult<String> {
        serde_json::to_string(self).map_err(|e| DomainError::MalformedCommand {
            reason: e.to_string(),
        })
    }

    /// Decodes and validates a command from a JSON document.
    ///
    /// The document must have exactly the keys `action`, `group` and
    /// `directory`, and the action must be one that travels on the
    /// command channel.
    pub fn from_value(value: Value) -> DomainResult<Self> {
        let Some(obj) = value.as_object() else {
            return Err(DomainError::MalformedCommand {
                reason: format!("not a JSON object, {value}"),
            });
        };

        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        if keys != COMMAND_KEYS {
            return Err(DomainError::MalformedCommand {
                reason: format!("unrecognized keys in data of payload in message, {value}"),
            });
        }

        let command: CommandMessage =
            serde_json::from_value(value.clone()).map_err(|_| DomainError::MalformedCommand {
                reason: format!("unrecognized action in data of payload in message, {value}"),
            })?;
        if !command.action.is_command() {
            return Err(DomainError::MalformedCommand {
                reason: format!("unrecognized action in data of payload in message, {value}"),
            });
        }
        Ok(command)
    }
}

/// Which kind of participant sent a status.
///
/// Anything other than `"ds"` is treated as a Tool Meister by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    /// The central Tool Data Sink
    #[serde(rename = "ds")]
    DataSink,

    /// A per-host Tool Meister
    #[serde(rename = "tm")]
    ToolMeister,

    /// Unrecognized marker
    #[serde(other)]
    Unknown,
}

impl Kind {
    /// Returns true for the data sink marker.
    pub fn is_data_sink(&self) -> bool {
        matches!(self, Self::DataSink)
    }
}

/// Completion status reported by a participant.
///
/// ```json
/// {"kind": "tm", "hostname": "h1.example.com", "status": "success"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Participant kind
    pub kind: Kind,

    /// Host the participant runs on
    pub hostname: String,

    /// `"success"` or a failure description
    pub status: String,
}

impl StatusMessage {
    /// Creates a status message.
    pub fn new(kind: Kind, hostname: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            kind,
            hostname: hostname.into(),
            status: status.into(),
        }
    }

    /// Creates a success status.
    pub fn success(kind: Kind, hostname: impl Into<String>) -> Self {
        Self::new(kind, hostname, STATUS_SUCCESS)
    }

    /// Returns true if the status reports success.
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    /// Serializes the status to its JSON wire form.
    pub fn to_json(&self) -> DomainResult<String> {
        serde_json::to_string(self).map_err(|e| DomainError::MalformedStatus {
            reason: e.to_string(),
        })
    }

    /// Decodes a status from an already-parsed JSON document.
    ///
    /// A document that is valid JSON but lacks `kind`, `hostname` or
    /// `status` is a [`DomainError::MalformedStatus`].
    pub fn from_value(value: Value) -> DomainResult<Self> {
        serde_json::from_value(value.clone()).map_err(|e| DomainError::MalformedStatus {
            reason: format!("unrecognized status payload, {value}: {e}"),
        })
    }
}
