//! The full stop sequence: end the tools, optionally collect system
//! information, then terminate every participant.

use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use tm_core::Action;

use crate::coordinator::Coordinator;
use crate::error::{exit_code, CoordinatorError};
use crate::report::{CycleReport, TerminateReport};

/// Parameters of one stop.
#[derive(Debug, Clone)]
pub struct StopRequest {
    /// Tool group being stopped
    pub group: String,
    /// Benchmark run directory
    pub run_dir: PathBuf,
    /// Collect system information after ending the tools
    pub sysinfo: bool,
    /// The stop responds to an interrupt: skip sysinfo and do not fail on
    /// a rejected `end`
    pub interrupt: bool,
}

/// What each step of the stop produced.
#[derive(Debug)]
pub struct StopOutcome {
    pub end: Result<CycleReport, CoordinatorError>,
    pub sysinfo: Option<Result<CycleReport, CoordinatorError>>,
    pub terminate: Result<TerminateReport, CoordinatorError>,
    interrupt: bool,
}

fn step_code<T>(result: &Result<T, CoordinatorError>, ok: impl Fn(&T) -> bool) -> i32 {
    match result {
        Ok(report) if ok(report) => exit_code::SUCCESS,
        Ok(_) => exit_code::CYCLE_FAILED,
        Err(e) => e.exit_code(),
    }
}

impl StopOutcome {
    /// Exit code of the whole stop.
    ///
    /// A failed `end` decides the code unless the stop is an interrupt;
    /// otherwise the terminate step does. Sysinfo never affects it.
    pub fn exit_code(&self) -> i32 {
        let end = step_code(&self.end, CycleReport::is_success);
        if end != exit_code::SUCCESS && !self.interrupt {
            end
        } else {
            step_code(&self.terminate, TerminateReport::is_success)
        }
    }
}

/// Directory the `end` action stores tool data in.
pub fn tool_dir(run_dir: &Path, group: &str) -> PathBuf {
    run_dir.join(format!("tools-{group}"))
}

/// Directory the closing `sysinfo` action stores data in.
pub fn sysinfo_dir(run_dir: &Path) -> PathBuf {
    run_dir.join("sysinfo").join("end")
}

/// Runs end, sysinfo and terminate in order.
pub async fn run_stop(coordinator: &Coordinator, request: &StopRequest) -> StopOutcome {
    let tools = tool_dir(&request.run_dir, &request.group);
    let end = match tokio::fs::create_dir_all(&tools).await {
        Ok(()) => {
            let directory = tools.display().to_string();
            coordinator
                .dispatch(Action::End, Some(&request.group), Some(&directory))
                .await
        }
        Err(e) => {
            error!(path = %tools.display(), error = %e, "Failed to create tool output directory");
            Err(CoordinatorError::Domain(tm_core::DomainError::InvalidFieldValue {
                field: "tool directory".to_string(),
                value: tools.display().to_string(),
                expected: "a creatable directory".to_string(),
            }))
        }
    };
    let end_ok = matches!(&end, Ok(report) if report.is_success());

    if request.interrupt && request.sysinfo {
        warn!("system information not collected when --interrupt specified");
    }

    let sysinfo = if end_ok && request.sysinfo && !request.interrupt {
        let path = sysinfo_dir(&request.run_dir);
        match tokio::fs::create_dir_all(&path).await {
            Ok(()) => {
                info!("Collecting system information");
                let directory = path.display().to_string();
                Some(
                    coordinator
                        .dispatch(Action::Sysinfo, Some(&request.group), Some(&directory))
                        .await,
                )
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Unable to create sysinfo directory");
                None
            }
        }
    } else {
        None
    };

    let terminate = coordinator.terminate().await;

    StopOutcome {
        end,
        sysinfo,
        terminate,
        interrupt: request.interrupt,
    }
}
