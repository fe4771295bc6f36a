//! Tool Meister lifecycle.
//!
//! ```text
//!   startup ──init──▶ idle ──start──▶ running
//!                      ▲                 │
//!                      └──────stop───────┘
//!                      │
//!                      └──end──▶ shutdown
//! ```
//!
//! `send` and `sysinfo` are accepted in every state and do not move the
//! Tool Meister. `terminate` ends the command loop from any state.

use std::fmt;

use thiserror::Error;
use tm_core::Action;

/// Where a Tool Meister is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ToolMeisterState {
    /// Waiting for the first `init`
    #[default]
    Startup,
    /// Persistent tools set up, transient tools stopped
    Idle,
    /// Transient tools collecting
    Running,
    /// Tools torn down; only `send`, `sysinfo` and `terminate` remain useful
    Shutdown,
}

impl ToolMeisterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Shutdown => "shutdown",
        }
    }

    /// Decides what `action` does in this state.
    pub fn step(self, action: Action) -> Result<Step, UnexpectedAction> {
        let next = match (action, self) {
            (Action::Terminate, _) => return Ok(Step::Terminate),
            (Action::Send | Action::Sysinfo, _) => return Ok(Step::Stay),
            (Action::Init, Self::Startup) => Self::Idle,
            (Action::Start, Self::Idle) => Self::Running,
            (Action::Stop, Self::Running) => Self::Idle,
            (Action::End, Self::Idle) => Self::Shutdown,
            _ => {
                return Err(UnexpectedAction {
                    action,
                    state: self,
                })
            }
        };
        Ok(Step::Move(next))
    }
}

impl fmt::Display for ToolMeisterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effect of an accepted action on the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Run the action, state unchanged
    Stay,
    /// Run the action and enter the given state
    Move(ToolMeisterState),
    /// Leave the command loop without a status
    Terminate,
}

/// An action that is not valid in the current state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("ignoring unexpected action '{action}' in state '{state}'")]
pub struct UnexpectedAction {
    pub action: Action,
    pub state: ToolMeisterState,
}
