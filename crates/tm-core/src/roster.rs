//! Participant roster stored in the broker under the roster key.
//!
//! The roster is written once by the setup step and read by every client
//! invocation during a run:
//!
//! ```json
//! {
//!   "ds": {"pid": 4242},
//!   "tm": [{"hostname": "h1.example.com", "pid": 1001}]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{DomainError, DomainResult};

/// Roster entry for the Tool Data Sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSinkEntry {
    /// Process ID of the data sink
    pub pid: u32,

    /// Any additional fields recorded by the setup step
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl DataSinkEntry {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            extra: BTreeMap::new(),
        }
    }
}

/// Roster entry for one Tool Meister.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMeisterEntry {
    /// Full hostname the Tool Meister runs on
    pub hostname: String,

    /// Process ID of the Tool Meister on that host
    pub pid: u32,

    /// Any additional fields recorded by the setup step
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ToolMeisterEntry {
    pub fn new(hostname: impl Into<String>, pid: u32) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
            extra: BTreeMap::new(),
        }
    }
}

/// Roster as decoded from the broker, before validation.
///
/// Either section may be absent; [`RosterDocument::validate`] turns the
/// document into a [`Roster`] only when both are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RosterDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ds: Option<DataSinkEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tm: Option<Vec<ToolMeisterEntry>>,
}

impl RosterDocument {
    /// Parses a roster document from its JSON text.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        serde_json::from_str(raw).map_err(|e| DomainError::RosterMalformed {
            reason: e.to_string(),
        })
    }

    /// Number of participants listed, counting whichever sections exist.
    pub fn listed_count(&self) -> usize {
        usize::from(self.ds.is_some()) + self.tm.as_ref().map_or(0, Vec::len)
    }

    /// Validates that both the data sink and the tool meister list exist.
    pub fn validate(self) -> DomainResult<Roster> {
        let data_sink = self.ds.ok_or(DomainError::RosterMissingDataSink)?;
        let tool_meisters = self.tm.ok_or(DomainError::RosterMissingToolMeisters)?;
        Ok(Roster {
            data_sink,
            tool_meisters,
        })
    }

    /// Serializes the document to JSON.
    pub fn to_json(&self) -> DomainResult<String> {
        serde_json::to_string(self).map_err(|e| DomainError::RosterMalformed {
            reason: e.to_string(),
        })
    }
}

/// A validated roster: one data sink plus zero or more tool meisters.
#[derive(Debug, Clone, PartialEq)]
pub struct Roster {
    pub data_sink: DataSinkEntry,
    pub tool_meisters: Vec<ToolMeisterEntry>,
}

impl Roster {
    /// Number of participants expected to answer a command.
    pub fn expected_count(&self) -> usize {
        1 + self.tool_meisters.len()
    }

    /// Iterates over every participant with its recorded PID.
    pub fn participants(&self) -> impl Iterator<Item = (ParticipantId, u32)> + '_ {
        std::iter::once((ParticipantId::DataSink, self.data_sink.pid)).chain(
            self.tool_meisters
                .iter()
                .map(|tm| (ParticipantId::ToolMeister(tm.hostname.clone()), tm.pid)),
        )
    }
}

impl From<Roster> for RosterDocument {
    fn from(roster: Roster) -> Self {
        Self {
            ds: Some(roster.data_sink),
            tm: Some(roster.tool_meisters),
        }
    }
}

/// Identity of a participant in the client's tracking table.
///
/// The data sink has its own reserved slot so a Tool Meister host can
/// never collide with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParticipantId {
    DataSink,
    ToolMeister(String),
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataSink => f.write_str("ds"),
            Self::ToolMeister(hostname) => f.write_str(hostname),
        }
    }
}
