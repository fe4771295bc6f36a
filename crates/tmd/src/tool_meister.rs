//! Tool Meister: runs the registered tools on one host.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use tm_core::{CommandMessage, STATUS_SUCCESS};

use crate::params::ToolMeisterParams;
use crate::participant::{CommandHandler, Reply};
use crate::runner::ToolRunner;
use crate::state::{Step, ToolMeisterState};

/// Command handler for a Tool Meister.
pub struct ToolMeister {
    params: ToolMeisterParams,
    state: ToolMeisterState,
    runner: Box<dyn ToolRunner>,
}

impl ToolMeister {
    pub fn new(params: ToolMeisterParams, runner: Box<dyn ToolRunner>) -> Self {
        info!(
            hostname = %params.hostname,
            group = %params.group,
            tools = params.tools.len(),
            "Tool Meister ready"
        );
        Self {
            params,
            state: ToolMeisterState::default(),
            runner,
        }
    }

    pub fn params(&self) -> &ToolMeisterParams {
        &self.params
    }

    pub fn state(&self) -> ToolMeisterState {
        self.state
    }
}

#[async_trait]
impl CommandHandler for ToolMeister {
    async fn handle(&mut self, command: &CommandMessage) -> Reply {
        let step = match self.state.step(command.action) {
            Ok(Step::Terminate) => return Reply::Exit,
            Ok(step) => step,
            Err(unexpected) => {
                warn!(hostname = %self.params.hostname, "{unexpected}");
                return Reply::Status(unexpected.to_string());
            }
        };

        // The state moves even when some tools fail the action.
        if let Step::Move(next) = step {
            debug!(from = %self.state, to = %next, action = %command.action, "State transition");
            self.state = next;
        }

        let directory = command.directory.as_deref().map(Path::new);
        match self.runner.run(command.action, directory).await {
            Ok(()) => Reply::Status(STATUS_SUCCESS.to_string()),
            Err(failure) => {
                warn!(hostname = %self.params.hostname, "{failure}");
                Reply::Status(failure.to_string())
            }
        }
    }
}
