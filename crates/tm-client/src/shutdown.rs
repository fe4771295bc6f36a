//! Tearing down the broker process after a successful terminate.
//!
//! The coordinator only calls [`ShutdownTransport::shutdown`]; how the
//! broker actually goes away is up to the implementation. [`PidFileShutdown`]
//! signals the PID recorded by the run's setup step, [`NoTransportShutdown`]
//! leaves the broker to whoever supervises it.

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::process::ProcessControl;

/// Interval between termination signals.
pub const DEFAULT_SIGNAL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors tearing down the broker.
#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("Unable to read broker PID file {path}: {source}")]
    ReadPidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Broker PID file {path} holds '{contents}', not a PID")]
    InvalidPid { path: PathBuf, contents: String },

    #[error("Unable to signal broker process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Stops the broker the control plane runs over.
#[async_trait]
pub trait ShutdownTransport: Send + Sync {
    /// Stops the broker. Returns whether anything was stopped.
    async fn shutdown(&self) -> Result<bool, ShutdownError>;
}

/// Leaves the broker running.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransportShutdown;

#[async_trait]
impl ShutdownTransport for NoTransportShutdown {
    async fn shutdown(&self) -> Result<bool, ShutdownError> {
        debug!("Broker teardown not managed here");
        Ok(false)
    }
}

/// Signals the PID stored in the broker's PID file until it is gone.
pub struct PidFileShutdown {
    pid_file: PathBuf,
    processes: Arc<dyn ProcessControl>,
    interval: Duration,
}

impl PidFileShutdown {
    pub fn new(pid_file: impl Into<PathBuf>, processes: Arc<dyn ProcessControl>) -> Self {
        Self {
            pid_file: pid_file.into(),
            processes,
            interval: DEFAULT_SIGNAL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl ShutdownTransport for PidFileShutdown {
    async fn shutdown(&self) -> Result<bool, ShutdownError> {
        let contents = match tokio::fs::read_to_string(&self.pid_file).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.pid_file.display(), "No broker PID file, nothing to stop");
                return Ok(false);
            }
            Err(source) => {
                return Err(ShutdownError::ReadPidFile {
                    path: self.pid_file.clone(),
                    source,
                })
            }
        };

        let pid: u32 = contents
            .trim()
            .parse()
            .map_err(|_| ShutdownError::InvalidPid {
                path: self.pid_file.clone(),
                contents: contents.trim().to_string(),
            })?;

        info!(pid, "Terminating broker process");
        loop {
            match self.processes.signal_terminate(pid) {
                Ok(true) => sleep(self.interval).await,
                Ok(false) => break,
                Err(source) => return Err(ShutdownError::Signal { pid, source }),
            }
        }
        debug!(pid, "Broker process gone");
        Ok(true)
    }
}
