//! Integration tests for participant command loops over an in-process broker.
//!
//! These tests drive a real `CommandLoop` the way the client does: commands
//! go out on the command channel and statuses come back on the status
//! channel.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use tm_core::{Action, ChannelNames, CommandMessage, Kind, StatusMessage};
use tm_protocol::{Broker, ChannelSubscriber, ChannelType, MemoryBroker};
use tmd::{
    CommandLoop, DataSink, DataSinkParams, LoopSummary, ToolFailure, ToolMeister,
    ToolMeisterParams, ToolRunner,
};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on any single wait in these tests
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between subscriber-count checks
const POLL_INTERVAL: Duration = Duration::from_millis(5);

// ============================================================================
// Test Helpers
// ============================================================================

struct AlwaysOk;

#[async_trait]
impl ToolRunner for AlwaysOk {
    async fn run(&self, _action: Action, _directory: Option<&Path>) -> Result<(), ToolFailure> {
        Ok(())
    }
}

fn channels() -> ChannelNames {
    ChannelNames::with_prefix("tool-meister")
}

fn tm_params() -> ToolMeisterParams {
    ToolMeisterParams {
        hostname: "h1".to_string(),
        group: "default".to_string(),
        tools: BTreeMap::new(),
        extra: BTreeMap::new(),
    }
}

async fn wait_for_listeners(broker: &MemoryBroker, channel: &str, count: usize) {
    timeout(WAIT_TIMEOUT, async {
        while broker.subscriber_count(channel) < count {
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .expect("participants did not subscribe");
}

fn spawn_tool_meister(
    broker: &MemoryBroker,
    token: CancellationToken,
) -> JoinHandle<tmd::Result<LoopSummary>> {
    let looper = CommandLoop::new(Arc::new(broker.clone()), channels(), Kind::ToolMeister, "h1")
        .group("default")
        .cancel_token(token);
    tokio::spawn(async move {
        let mut tm = ToolMeister::new(tm_params(), Box::new(AlwaysOk));
        looper.run(&mut tm).await
    })
}

async fn send(broker: &MemoryBroker, command: &CommandMessage) -> u64 {
    broker
        .publish(&channels().command, command.to_json().unwrap().as_bytes())
        .await
        .unwrap()
}

async fn next_status(status: &mut ChannelSubscriber) -> StatusMessage {
    let value = timeout(WAIT_TIMEOUT, status.next_json())
        .await
        .expect("status timed out")
        .unwrap()
        .expect("status channel ended");
    StatusMessage::from_value(value).unwrap()
}

fn cmd(action: Action, group: Option<&str>) -> CommandMessage {
    CommandMessage::new(action, group.map(str::to_string), Some("/run/tools-default".into()))
}

// ============================================================================
// Tool Meister
// ============================================================================

#[tokio::test]
async fn test_one_status_per_command_until_terminate() {
    let broker = MemoryBroker::new();
    let mut status = ChannelSubscriber::subscribe(&broker, &channels().status, ChannelType::OnlyOne)
        .await
        .unwrap();
    let handle = spawn_tool_meister(&broker, CancellationToken::new());
    wait_for_listeners(&broker, &channels().command, 1).await;

    assert_eq!(send(&broker, &cmd(Action::Init, Some("default"))).await, 1);
    let reply = next_status(&mut status).await;
    assert_eq!(reply.kind, Kind::ToolMeister);
    assert_eq!(reply.hostname, "h1");
    assert!(reply.is_success());

    // Addressed to another group: rejected with a failure status.
    send(&broker, &cmd(Action::Start, Some("other"))).await;
    let reply = next_status(&mut status).await;
    assert!(reply.status.starts_with("unrecognized group"));

    // Not JSON: skipped without a status.
    broker
        .publish(&channels().command, b"not json at all")
        .await
        .unwrap();

    // Valid but out of state (idle).
    send(&broker, &cmd(Action::Stop, None)).await;
    let reply = next_status(&mut status).await;
    assert_eq!(reply.status, "ignoring unexpected action 'stop' in state 'idle'");

    send(&broker, &CommandMessage::terminate()).await;
    let summary = timeout(WAIT_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(
        summary,
        LoopSummary {
            handled: 2,
            rejected: 1,
            unconfirmed: 0,
            terminated: true,
        }
    );

    assert_eq!(broker.published_on(&channels().status).len(), 3);
    assert_eq!(broker.subscriber_count(&channels().command), 0);
}

#[tokio::test]
async fn test_unheard_status_is_counted() {
    let broker = MemoryBroker::new();
    let handle = spawn_tool_meister(&broker, CancellationToken::new());
    wait_for_listeners(&broker, &channels().command, 1).await;

    // Nobody is listening on the status channel.
    send(&broker, &cmd(Action::Init, None)).await;
    send(&broker, &CommandMessage::terminate()).await;

    let summary = timeout(WAIT_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(summary.handled, 1);
    assert_eq!(summary.unconfirmed, 1);
}

#[tokio::test]
async fn test_cancellation_ends_loop() {
    let broker = MemoryBroker::new();
    let token = CancellationToken::new();
    let handle = spawn_tool_meister(&broker, token.clone());
    wait_for_listeners(&broker, &channels().command, 1).await;

    token.cancel();
    let summary = timeout(WAIT_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert!(!summary.terminated);
    assert_eq!(broker.subscriber_count(&channels().command), 0);
}

#[tokio::test]
async fn test_broker_closing_channel_ends_loop() {
    let broker = MemoryBroker::new();
    let handle = spawn_tool_meister(&broker, CancellationToken::new());
    wait_for_listeners(&broker, &channels().command, 1).await;

    broker.disconnect_all();
    let summary = timeout(WAIT_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert!(!summary.terminated);
}

#[tokio::test]
async fn test_offline_broker_fails_subscribe() {
    let broker = MemoryBroker::new();
    broker.set_offline(true);
    let looper = CommandLoop::new(Arc::new(broker.clone()), channels(), Kind::ToolMeister, "h1")
        .subscribe_max_wait(Duration::from_millis(50));
    let mut tm = ToolMeister::new(tm_params(), Box::new(AlwaysOk));
    let err = looper.run(&mut tm).await.unwrap_err();
    assert!(matches!(err, tmd::ParticipantError::Subscribe(_)));
}

// ============================================================================
// Data Sink
// ============================================================================

#[tokio::test]
async fn test_data_sink_reports_as_ds() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("tools-default");

    let broker = MemoryBroker::new();
    let mut status = ChannelSubscriber::subscribe(&broker, &channels().status, ChannelType::OnlyOne)
        .await
        .unwrap();
    let looper = CommandLoop::new(Arc::new(broker.clone()), channels(), Kind::DataSink, "ctl");
    let handle = tokio::spawn(async move {
        let mut ds = DataSink::new(DataSinkParams {
            hostname: "ctl".to_string(),
            extra: BTreeMap::new(),
        });
        looper.run(&mut ds).await
    });
    wait_for_listeners(&broker, &channels().command, 1).await;

    let command = CommandMessage::new(
        Action::End,
        Some("default".into()),
        Some(target.display().to_string()),
    );
    send(&broker, &command).await;
    let reply = next_status(&mut status).await;
    assert_eq!(reply.kind, Kind::DataSink);
    assert!(reply.is_success());
    assert!(target.is_dir());

    send(&broker, &CommandMessage::terminate()).await;
    let summary = timeout(WAIT_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert!(summary.terminated);
}
