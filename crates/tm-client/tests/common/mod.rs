//! Shared fixtures for coordinator integration tests.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tm_client::{Coordinator, CoordinatorConfig, ProcessControl};
use tm_protocol::{Broker, BrokerError, BrokerResult, PubSubEvent, Subscription};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Scripted Broker
// ============================================================================

/// What a scripted broker saw.
#[derive(Debug, Default)]
pub struct Log {
    pub pings: usize,
    pub gets: usize,
    pub subscribes: Vec<String>,
    pub published: Vec<(String, String)>,
    pub events_read: usize,
}

/// Broker that answers from a fixed script.
///
/// - `get` returns the roster (for any key), or `get_error` as a server reply
/// - `publish` returns the configured live-subscriber count
/// - every subscription delivers an OnlyOne ack, then `statuses`, then
///   reports the connection closed (or goes silent with `hold_open`)
pub struct ScriptedBroker {
    pub roster: Option<String>,
    pub publish_count: u64,
    pub statuses: Vec<Vec<u8>>,
    pub offline: bool,
    pub hold_open: bool,
    pub get_error: Option<String>,
    pub log: Arc<Mutex<Log>>,
}

impl ScriptedBroker {
    pub fn new(roster: Option<&str>, publish_count: u64, statuses: Vec<Vec<u8>>) -> Self {
        Self {
            roster: roster.map(str::to_string),
            publish_count,
            statuses,
            offline: false,
            hold_open: false,
            get_error: None,
            log: Arc::new(Mutex::new(Log::default())),
        }
    }

    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::new(None, 0, Vec::new())
        }
    }

    fn refused() -> BrokerError {
        BrokerError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }
}

#[async_trait]
impl Broker for ScriptedBroker {
    async fn ping(&self) -> BrokerResult<()> {
        self.log.lock().unwrap().pings += 1;
        if self.offline {
            return Err(Self::refused());
        }
        Ok(())
    }

    async fn get(&self, _key: &str) -> BrokerResult<Option<Vec<u8>>> {
        self.log.lock().unwrap().gets += 1;
        if let Some(reply) = &self.get_error {
            return Err(BrokerError::Server(reply.clone()));
        }
        Ok(self.roster.clone().map(String::into_bytes))
    }

    async fn set(&self, _key: &str, _value: &[u8]) -> BrokerResult<()> {
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> BrokerResult<u64> {
        self.log.lock().unwrap().published.push((
            channel.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        ));
        Ok(self.publish_count)
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<Box<dyn Subscription>> {
        self.log.lock().unwrap().subscribes.push(channel.to_string());
        let mut events: VecDeque<PubSubEvent> = VecDeque::new();
        events.push_back(PubSubEvent::subscribe_ack(channel, 1));
        for payload in &self.statuses {
            events.push_back(PubSubEvent::message(channel, payload.clone()));
        }
        Ok(Box::new(ScriptedSubscription {
            channel: channel.to_string(),
            events,
            hold_open: self.hold_open,
            log: Arc::clone(&self.log),
        }))
    }

    fn endpoint(&self) -> String {
        "scripted://".to_string()
    }
}

struct ScriptedSubscription {
    channel: String,
    events: VecDeque<PubSubEvent>,
    hold_open: bool,
    log: Arc<Mutex<Log>>,
}

#[async_trait]
impl Subscription for ScriptedSubscription {
    async fn next_event(&mut self) -> BrokerResult<PubSubEvent> {
        self.log.lock().unwrap().events_read += 1;
        match self.events.pop_front() {
            Some(event) => Ok(event),
            None if self.hold_open => std::future::pending().await,
            None => Err(BrokerError::ConnectionClosed),
        }
    }

    async fn unsubscribe(&mut self) -> BrokerResult<()> {
        self.events.clear();
        self.events
            .push_back(PubSubEvent::unsubscribe_ack(self.channel.clone(), 0));
        Ok(())
    }

    async fn close(&mut self) -> BrokerResult<()> {
        Ok(())
    }
}

// ============================================================================
// Fake Processes
// ============================================================================

/// Processes that are alive until probed a fixed number of times.
#[derive(Default)]
pub struct FakeProcesses {
    alive: Mutex<Vec<(u32, usize)>>,
    pub probed: Mutex<Vec<u32>>,
    pub signalled: Mutex<HashSet<u32>>,
}

impl FakeProcesses {
    /// `pid` reports running for `probes` probes, then exits.
    pub fn alive_for(self, pid: u32, probes: usize) -> Self {
        self.alive.lock().unwrap().push((pid, probes));
        self
    }
}

impl ProcessControl for FakeProcesses {
    fn is_running(&self, pid: u32) -> bool {
        self.probed.lock().unwrap().push(pid);
        let mut alive = self.alive.lock().unwrap();
        match alive.iter_mut().find(|(p, _)| *p == pid) {
            Some((_, left)) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    fn signal_terminate(&self, pid: u32) -> io::Result<bool> {
        self.signalled.lock().unwrap().insert(pid);
        Ok(self.is_running(pid))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub const ROSTER_3: &str =
    r#"{"ds":{"pid":1},"tm":[{"hostname":"h1","pid":2},{"hostname":"h2","pid":3}]}"#;

pub const ROSTER_4: &str = r#"{"ds":{"pid":1},"tm":[{"hostname":"h1","pid":2},{"hostname":"h2","pid":3},{"hostname":"h3","pid":4}]}"#;

pub fn status(kind: &str, hostname: &str, status: &str) -> Vec<u8> {
    json!({"kind": kind, "hostname": hostname, "status": status})
        .to_string()
        .into_bytes()
}

pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        roster_timeout: Duration::from_millis(500),
        roster_poll_interval: Duration::from_millis(50),
        subscribe_max_wait: Duration::from_millis(200),
        local_hostname: "ctl.example.com".to_string(),
        liveness_interval: Duration::from_millis(10),
        ..CoordinatorConfig::default()
    }
}

/// Cancels `token` after `delay`.
pub fn cancel_after(token: &CancellationToken, delay: Duration) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        token.cancel();
    });
}

pub fn coordinator(broker: Arc<dyn Broker>) -> Coordinator {
    Coordinator::new(broker, test_config()).with_processes(Arc::new(FakeProcesses::default()))
}
