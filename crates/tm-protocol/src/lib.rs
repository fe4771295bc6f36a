//! Tool Meister Protocol - Broker wire layer
//!
//! This crate provides everything the control plane needs from the
//! publish/subscribe broker:
//! - `resp` - RESP2 codec for talking to a Redis server
//! - `broker` - The `Broker` / `Subscription` traits and pub/sub events
//! - `redis` - TCP implementation of `Broker` against a Redis server
//! - `memory` - In-process implementation of `Broker` (`test-util` feature)
//! - `subscriber` - Validated channel subscriptions with decoded payloads
//! - `rendezvous` - Blocking wait for a key to appear in the broker
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌──────────────────┐
//! │ ChannelSubscriber│   │    Rendezvous    │
//! └────────┬─────────┘   └────────┬─────────┘
//!          │ subscribe/next_event │ get
//!          ▼                      ▼
//! ┌─────────────────────────────────────────┐
//! │            dyn Broker                   │
//! ├────────────────────┬────────────────────┤
//! │  RedisBroker (TCP) │  MemoryBroker      │
//! │  RespCodec framing │  (in-process)      │
//! └────────────────────┴────────────────────┘
//! ```

pub mod broker;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod redis;
pub mod rendezvous;
pub mod resp;
pub mod subscriber;

pub use broker::{Broker, EventData, EventKind, PubSubEvent, Subscription};
pub use error::{AckMismatch, BrokerError, BrokerResult, SubscribeError};
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryBroker;
pub use redis::RedisBroker;
pub use rendezvous::{wait_for_key, Notice, Rendezvous, RendezvousError, RendezvousStats};
pub use resp::{Command, RespCodec, RespValue};
pub use subscriber::{ChannelSubscriber, ChannelType, SUBSCRIBE_MAX_WAIT, SUBSCRIBE_RETRY_DELAY};
