//! Tool Meister Core - Shared types for the Tool Meister control plane
//!
//! This crate provides the domain types shared between the client
//! coordinator (tm-client), the broker layer (tm-protocol) and the
//! protocol participants (tmd).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod action;
pub mod channel;
pub mod config;
pub mod error;
pub mod message;
pub mod roster;

// Re-exports for convenience
pub use action::Action;
pub use channel::{ChannelNames, DEFAULT_CHANNEL_PREFIX};
pub use config::{BrokerAddress, TmConfig, DEFAULT_BROKER_PORT, DEFAULT_ROSTER_KEY};
pub use error::{DomainError, DomainResult};
pub use message::{CommandMessage, Kind, StatusMessage, STATUS_SUCCESS};
pub use roster::{DataSinkEntry, ParticipantId, Roster, RosterDocument, ToolMeisterEntry};
