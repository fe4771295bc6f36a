//! Tool Meister Client - Control-plane coordinator
//!
//! This crate drives the participants listed in the roster:
//! - `coordinator` - `dispatch` one action and collect every status; `terminate`
//! - `report` - Tracking table, cycle failures and reports
//! - `error` - Fatal coordinator errors and their exit codes
//! - `process` - Local process liveness probes and signals
//! - `shutdown` - Broker teardown behind the `ShutdownTransport` seam
//! - `stop` - End, sysinfo and terminate as one stop sequence
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod coordinator;
pub mod error;
pub mod process;
pub mod report;
pub mod shutdown;
pub mod stop;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use error::{exit_code, CoordinatorError, Result};
pub use process::{ProcessControl, SystemProcesses};
pub use report::{CycleFailure, CycleReport, TerminateReport, TrackingEntry, TrackingTable};
pub use shutdown::{NoTransportShutdown, PidFileShutdown, ShutdownError, ShutdownTransport};
pub use stop::{run_stop, StopOutcome, StopRequest};
