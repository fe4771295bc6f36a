//! Integration tests for the key rendezvous.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tm_protocol::{
    Broker, BrokerError, BrokerResult, Notice, Rendezvous, RendezvousError, Subscription,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Broker whose `get` replays a scripted sequence of replies.
struct ScriptedGets {
    replies: Mutex<VecDeque<BrokerResult<Option<Vec<u8>>>>>,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedGets {
    fn new(replies: Vec<BrokerResult<Option<Vec<u8>>>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

fn refused() -> BrokerResult<Option<Vec<u8>>> {
    Err(BrokerError::Io(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "refused",
    )))
}

#[async_trait]
impl Broker for ScriptedGets {
    async fn get(&self, _key: &str) -> BrokerResult<Option<Vec<u8>>> {
        self.calls.lock().unwrap().push(Instant::now());
        self.replies.lock().unwrap().pop_front().unwrap_or(Ok(None))
    }

    async fn set(&self, _key: &str, _value: &[u8]) -> BrokerResult<()> {
        Ok(())
    }

    async fn publish(&self, _channel: &str, _payload: &[u8]) -> BrokerResult<u64> {
        Ok(0)
    }

    async fn subscribe(&self, _channel: &str) -> BrokerResult<Box<dyn Subscription>> {
        Err(BrokerError::ConnectionClosed)
    }

    fn endpoint(&self) -> String {
        "scripted://".to_string()
    }
}

#[tokio::test(start_paused = true)]
async fn test_blocks_through_misses_then_returns_value() {
    let broker = ScriptedGets::new(vec![Ok(None), Ok(None), Ok(Some(b"{\"ds\":{}}".to_vec()))]);

    let (value, stats) = Rendezvous::new(&broker, "tm-pids", "tool-meister-client")
        .wait()
        .await
        .unwrap();

    assert_eq!(value, "{\"ds\":{}}");
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.errors, 0);

    // Slept one interval between each attempt.
    let calls = broker.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    for pair in calls.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(1));
    }

    // Two misses is below the notice threshold.
    let missing = stats
        .notices
        .iter()
        .filter(|n| matches!(n, Notice::KeyMissing { .. }))
        .count();
    assert_eq!(missing, 0);
    assert_eq!(
        stats.notices,
        vec![Notice::Summary { attempts: 3, errors: 0 }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_connection_notices_follow_transitions() {
    let broker = ScriptedGets::new(vec![
        refused(),
        refused(),
        Ok(None),
        refused(),
        Ok(Some(b"v".to_vec())),
    ]);

    let (value, stats) = Rendezvous::new(&broker, "k", "tool-meister")
        .wait()
        .await
        .unwrap();

    assert_eq!(value, "v");
    assert_eq!(stats.errors, 3);
    assert_eq!(
        stats.notices,
        vec![
            Notice::WaitingToConnect,
            Notice::Connected,
            Notice::Disconnected,
            Notice::Connected,
            Notice::Summary { attempts: 5, errors: 3 },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_loading_reply_is_retried() {
    let broker = ScriptedGets::new(vec![
        Err(BrokerError::Server("LOADING Redis is loading the dataset in memory".to_string())),
        Ok(Some(b"v".to_vec())),
    ]);
    let (value, stats) = Rendezvous::new(&broker, "k", "p").wait().await.unwrap();
    assert_eq!(value, "v");
    assert_eq!(stats.errors, 1);
    assert_eq!(
        stats.notices,
        vec![
            Notice::WaitingToConnect,
            Notice::Connected,
            Notice::Summary { attempts: 2, errors: 1 },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_other_server_errors_end_the_wait() {
    for reply in [
        "WRONGTYPE Operation against a key holding the wrong kind of value",
        "NOAUTH Authentication required.",
    ] {
        let broker = ScriptedGets::new(vec![
            Err(BrokerError::Server(reply.to_string())),
            Ok(Some(b"v".to_vec())),
        ]);
        match Rendezvous::new(&broker, "tm-pids", "p").wait().await {
            Err(RendezvousError::Broker { key, source }) => {
                assert_eq!(key, "tm-pids");
                assert!(matches!(source, BrokerError::Server(m) if m == reply));
            }
            other => panic!("expected broker error, got {other:?}"),
        }
        assert_eq!(broker.calls.lock().unwrap().len(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_bounds_the_wait() {
    let broker = ScriptedGets::new(Vec::new());
    let token = CancellationToken::new();
    let deadline = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        deadline.cancel();
    });

    let started = Instant::now();
    let result = Rendezvous::new(&broker, "tm-pids", "tool-meister-client")
        .poll_interval(Duration::from_millis(250))
        .cancel_token(token)
        .wait()
        .await;

    match result {
        Err(RendezvousError::Cancelled { key, stats }) => {
            assert_eq!(key, "tm-pids");
            assert!(stats.attempts >= 20);
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(6));
}
