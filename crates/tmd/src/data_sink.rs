//! Tool Data Sink: the central participant that receives tool data.
//!
//! Data transfer itself is outside the control plane; for the protocol the
//! data sink only has to make sure each command's directory exists and
//! answer with its status.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, error};

use tm_core::{Action, CommandMessage, STATUS_SUCCESS};

use crate::params::DataSinkParams;
use crate::participant::{CommandHandler, Reply};

/// Command handler for the Tool Data Sink.
pub struct DataSink {
    params: DataSinkParams,
}

impl DataSink {
    pub fn new(params: DataSinkParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &DataSinkParams {
        &self.params
    }
}

#[async_trait]
impl CommandHandler for DataSink {
    async fn handle(&mut self, command: &CommandMessage) -> Reply {
        if command.action == Action::Terminate {
            return Reply::Exit;
        }

        let Some(directory) = command.directory.as_deref() else {
            debug!(action = %command.action, "No directory with command");
            return Reply::Status(STATUS_SUCCESS.to_string());
        };

        match tokio::fs::create_dir_all(Path::new(directory)).await {
            Ok(()) => {
                debug!(action = %command.action, directory, "Directory ready");
                Reply::Status(STATUS_SUCCESS.to_string())
            }
            Err(e) => {
                error!(directory, error = %e, "Unable to create directory");
                Reply::Status(format!("unable to create directory {directory}: {e}"))
            }
        }
    }
}
