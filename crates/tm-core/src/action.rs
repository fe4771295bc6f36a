//! Control-plane actions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DomainError;

/// An action requested of the Tool Meister fleet.
///
/// Every variant except [`Action::Kill`] can travel on the command channel.
/// `kill` exists only at the client: it is accepted and reported as a
/// success without touching the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Initialize the registered tools
    Init,
    /// Start the tools collecting into a directory
    Start,
    /// Stop running tools
    Stop,
    /// Send collected tool data to the data sink
    Send,
    /// End persistent tools
    End,
    /// Collect system configuration information
    Sysinfo,
    /// Shut the participant down
    Terminate,
    /// Forceful kill (client-side placeholder)
    Kill,
}

impl Action {
    /// All known actions, in lifecycle order.
    pub const ALL: [Action; 8] = [
        Action::Init,
        Action::Start,
        Action::Stop,
        Action::Send,
        Action::End,
        Action::Sysinfo,
        Action::Terminate,
        Action::Kill,
    ];

    /// Returns the wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Send => "send",
            Self::End => "end",
            Self::Sysinfo => "sysinfo",
            Self::Terminate => "terminate",
            Self::Kill => "kill",
        }
    }

    /// Returns true if the action may be published on the command channel.
    pub fn is_command(&self) -> bool {
        !matches!(self, Self::Kill)
    }

    fn allowed_list() -> String {
        Self::ALL
            .iter()
            .map(Action::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| DomainError::UnknownAction {
                action: s.to_string(),
                allowed: Self::allowed_list(),
            })
    }
}
