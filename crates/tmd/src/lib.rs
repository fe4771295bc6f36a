//! Tool Meister Daemons - Protocol participants
//!
//! This crate provides the two kinds of participant the client drives:
//! - `participant` - Command loop: validate, act, report one status
//! - `tool_meister` - Per-host Tool Meister and its lifecycle (`state`)
//! - `data_sink` - Central Tool Data Sink
//! - `runner` - `ToolRunner` seam and the tool-script runner
//! - `params` - Parameter documents read from the broker
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  command channel   ┌──────────────────────────────┐
//! │  tm-client   │───────────────────▶│ CommandLoop (per participant)│
//! │ (Coordinator)│                    │   ├─ ToolMeister ─▶ ToolRunner│
//! │              │◀───────────────────│   └─ DataSink                │
//! └──────────────┘   status channel   └──────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Bad commands are answered with a failure status, never a crash

pub mod data_sink;
pub mod error;
pub mod params;
pub mod participant;
pub mod runner;
pub mod state;
pub mod tool_meister;

pub use data_sink::DataSink;
pub use error::{ParticipantError, Result};
pub use params::{fetch_params, DataSinkParams, ToolMeisterParams};
pub use participant::{CommandHandler, CommandLoop, LoopSummary, Reply};
pub use runner::{ScriptRunner, ToolFailure, ToolRunner};
pub use state::{Step, ToolMeisterState, UnexpectedAction};
pub use tool_meister::ToolMeister;
