//! In-process implementation of [`Broker`].
//!
//! Behaves like a single Redis server for the operations the control plane
//! uses: publish returns the number of live subscribers, each subscription
//! first delivers a `subscribe` acknowledgement with a count of 1, and
//! dropping a subscription removes it from the channel. The broker can be
//! taken offline (every call fails with a connection error) and can close
//! every subscriber's connection at once.
//!
//! Built for this crate's tests and, through the `test-util` feature, for
//! the tests of crates layered on top.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

use crate::broker::{Broker, PubSubEvent, Subscription};
use crate::error::{BrokerError, BrokerResult};

enum Delivery {
    Event(PubSubEvent),
    Closed,
}

#[derive(Default)]
struct Inner {
    keys: HashMap<String, Vec<u8>>,
    channels: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Delivery>)>>,
    next_id: u64,
    offline: bool,
    get_calls: usize,
    subscribe_calls: usize,
    published: Vec<(String, Vec<u8>)>,
}

impl Inner {
    fn check_online(&self) -> BrokerResult<()> {
        if self.offline {
            return Err(BrokerError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "memory broker is offline",
            )));
        }
        Ok(())
    }

    fn remove(&mut self, channel: &str, id: u64) -> Option<mpsc::UnboundedSender<Delivery>> {
        let subscribers = self.channels.get_mut(channel)?;
        let pos = subscribers.iter().position(|(sid, _)| *sid == id)?;
        let (_, tx) = subscribers.swap_remove(pos);
        if subscribers.is_empty() {
            self.channels.remove(channel);
        }
        Some(tx)
    }
}

/// Shared in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every subsequent call fail with a connection error (or
    /// succeed again).
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Closes every subscriber's connection; their next read reports
    /// [`BrokerError::ConnectionClosed`].
    pub fn disconnect_all(&self) {
        let mut inner = self.lock();
        for (_, subscribers) in inner.channels.drain() {
            for (_, tx) in subscribers {
                let _ = tx.send(Delivery::Closed);
            }
        }
    }

    /// Number of live subscribers on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock().channels.get(channel).map_or(0, Vec::len)
    }

    /// Number of `get` calls seen so far.
    pub fn get_calls(&self) -> usize {
        self.lock().get_calls
    }

    /// Number of `subscribe` calls seen so far.
    pub fn subscribe_calls(&self) -> usize {
        self.lock().subscribe_calls
    }

    /// Every payload published so far, with its channel.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().published.clone()
    }

    /// Payloads published on one channel, decoded as UTF-8.
    pub fn published_on(&self, channel: &str) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| String::from_utf8_lossy(p).into_owned())
            .collect()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> BrokerResult<()> {
        self.lock().check_online()
    }

    async fn get(&self, key: &str) -> BrokerResult<Option<Vec<u8>>> {
        let mut inner = self.lock();
        inner.get_calls += 1;
        inner.check_online()?;
        Ok(inner.keys.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> BrokerResult<()> {
        let mut inner = self.lock();
        inner.check_online()?;
        inner.keys.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> BrokerResult<u64> {
        let mut inner = self.lock();
        inner.check_online()?;
        inner.published.push((channel.to_string(), payload.to_vec()));

        let mut delivered = 0u64;
        if let Some(subscribers) = inner.channels.get_mut(channel) {
            subscribers.retain(|(_, tx)| {
                tx.send(Delivery::Event(PubSubEvent::message(channel, payload.to_vec())))
                    .is_ok()
            });
            delivered = subscribers.len() as u64;
        }
        debug!(channel, delivered, "Memory broker publish");
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<Box<dyn Subscription>> {
        let mut inner = self.lock();
        inner.subscribe_calls += 1;
        inner.check_online()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Delivery::Event(PubSubEvent::subscribe_ack(channel, 1)));

        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));

        Ok(Box::new(MemorySubscription {
            id,
            channel: channel.to_string(),
            rx,
            inner: Arc::clone(&self.inner),
        }))
    }

    fn endpoint(&self) -> String {
        "memory://".to_string()
    }
}

struct MemorySubscription {
    id: u64,
    channel: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
    inner: Arc<Mutex<Inner>>,
}

impl MemorySubscription {
    fn detach(&self) -> Option<mpsc::UnboundedSender<Delivery>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.channel, self.id)
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_event(&mut self) -> BrokerResult<PubSubEvent> {
        match self.rx.recv().await {
            Some(Delivery::Event(event)) => Ok(event),
            Some(Delivery::Closed) | None => Err(BrokerError::ConnectionClosed),
        }
    }

    async fn unsubscribe(&mut self) -> BrokerResult<()> {
        if let Some(tx) = self.detach() {
            let _ = tx.send(Delivery::Event(PubSubEvent::unsubscribe_ack(
                self.channel.clone(),
                0,
            )));
        }
        Ok(())
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.detach();
        self.rx.close();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.detach();
    }
}
