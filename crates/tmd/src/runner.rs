//! Executing actions against the registered tools.
//!
//! The Tool Meister does not know how a tool collects data; it hands each
//! accepted action to a [`ToolRunner`] and reports whatever comes back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use tm_core::Action;

/// Some tools failed an action. The display text becomes the status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{failed} of {total} tools failed to {action}")]
pub struct ToolFailure {
    pub action: Action,
    pub failed: usize,
    pub total: usize,
}

/// Runs an action for every registered tool.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Performs `action`, writing any output under `directory`.
    async fn run(&self, action: Action, directory: Option<&Path>) -> Result<(), ToolFailure>;
}

/// Runs `<install_dir>/tool-scripts/<tool> --<action> [--dir=<directory>] <options>`
/// once per tool, one tool at a time.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    script_dir: PathBuf,
    tools: BTreeMap<String, String>,
}

impl ScriptRunner {
    pub fn new(install_dir: impl AsRef<Path>, tools: BTreeMap<String, String>) -> Self {
        Self {
            script_dir: install_dir.as_ref().join("tool-scripts"),
            tools,
        }
    }

    fn command(
        &self,
        tool: &str,
        options: &str,
        action: Action,
        directory: Option<&Path>,
    ) -> Command {
        let mut cmd = Command::new(self.script_dir.join(tool));
        cmd.arg(format!("--{action}"));
        if let Some(dir) = directory {
            cmd.arg(format!("--dir={}", dir.display()));
        }
        cmd.args(options.split_whitespace());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ToolRunner for ScriptRunner {
    async fn run(&self, action: Action, directory: Option<&Path>) -> Result<(), ToolFailure> {
        let mut failed = 0;
        for (tool, options) in &self.tools {
            match self.command(tool, options, action, directory).status().await {
                Ok(status) if status.success() => {
                    debug!(tool = %tool, %action, "Tool action completed");
                }
                Ok(status) => {
                    warn!(tool = %tool, %action, code = ?status.code(), "Tool action failed");
                    failed += 1;
                }
                Err(e) => {
                    warn!(tool = %tool, %action, error = %e, "Unable to run tool script");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(ToolFailure {
                action,
                failed,
                total: self.tools.len(),
            });
        }
        Ok(())
    }
}
