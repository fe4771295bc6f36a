//! Redis implementation of [`Broker`] over TCP.
//!
//! Key/value and publish commands share one lazily opened connection that
//! is dropped on any connection failure and reopened by the next command.
//! That lets callers which retry (the rendezvous loop in particular) see
//! the broker come back without rebuilding the handle. Every subscription
//! gets a dedicated connection, since a subscribed Redis connection cannot
//! issue ordinary commands.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use tm_core::BrokerAddress;

use crate::broker::{Broker, PubSubEvent, Subscription};
use crate::error::{BrokerError, BrokerResult};
use crate::resp::{Command, RespCodec, RespValue};

type Connection = Framed<TcpStream, RespCodec>;

/// Broker handle for a Redis server.
pub struct RedisBroker {
    address: BrokerAddress,
    conn: Mutex<Option<Connection>>,
}

impl RedisBroker {
    /// Creates a handle without connecting.
    pub fn new(address: BrokerAddress) -> Self {
        Self {
            address,
            conn: Mutex::new(None),
        }
    }

    /// Creates a handle and verifies the server answers `PING`.
    pub async fn connect(address: BrokerAddress) -> BrokerResult<Self> {
        let broker = Self::new(address);
        Broker::ping(&broker).await?;
        Ok(broker)
    }

    /// Address this handle talks to.
    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    async fn open(&self) -> BrokerResult<Connection> {
        let stream = TcpStream::connect((self.address.host.as_str(), self.address.port)).await?;
        stream.set_nodelay(true)?;
        debug!(broker = %self.address, "Connected to broker");
        Ok(Framed::new(stream, RespCodec))
    }

    /// Sends one command on the shared connection and reads its reply.
    ///
    /// The connection is discarded unless the round trip completes. A caller
    /// that drops this future after the send would otherwise leave the reply
    /// unread, and the next command would take it as its own.
    async fn request(&self, command: Command) -> BrokerResult<RespValue> {
        let mut guard = self.conn.lock().await;

        if guard.is_none() {
            *guard = Some(self.open().await?);
        }

        let name = command.name();
        let mut slot = InFlight::new(&mut *guard);
        let Some(conn) = slot.conn() else {
            return Err(BrokerError::ConnectionClosed);
        };
        let result = roundtrip(conn, command).await;
        slot.complete();

        match result {
            Ok(RespValue::Error(message)) => Err(BrokerError::Server(message)),
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_connection_error() {
                    debug!(broker = %self.address, command = %name, error = %e, "Dropping broker connection");
                    *guard = None;
                }
                Err(e)
            }
        }
    }
}

/// Clears the shared connection on drop unless the request completed.
struct InFlight<'a> {
    slot: &'a mut Option<Connection>,
    done: bool,
}

impl<'a> InFlight<'a> {
    fn new(slot: &'a mut Option<Connection>) -> Self {
        Self { slot, done: false }
    }

    fn conn(&mut self) -> Option<&mut Connection> {
        self.slot.as_mut()
    }

    fn complete(mut self) {
        self.done = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.done {
            debug!("Request abandoned mid-flight, discarding broker connection");
            *self.slot = None;
        }
    }
}

async fn roundtrip(conn: &mut Connection, command: Command) -> BrokerResult<RespValue> {
    conn.send(command).await?;
    match conn.next().await {
        Some(reply) => reply,
        None => Err(BrokerError::ConnectionClosed),
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> BrokerResult<()> {
        match self.request(Command::new("PING")).await? {
            RespValue::Simple(s) if s == "PONG" => Ok(()),
            other => Err(BrokerError::Protocol(format!(
                "unexpected PING reply {}",
                other.describe()
            ))),
        }
    }

    async fn get(&self, key: &str) -> BrokerResult<Option<Vec<u8>>> {
        match self.request(Command::new("GET").arg(key)).await? {
            RespValue::Bulk(b) => Ok(Some(b)),
            RespValue::Null => Ok(None),
            other => Err(BrokerError::Protocol(format!(
                "unexpected GET reply {}",
                other.describe()
            ))),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> BrokerResult<()> {
        match self.request(Command::new("SET").arg(key).arg(value)).await? {
            RespValue::Simple(_) => Ok(()),
            other => Err(BrokerError::Protocol(format!(
                "unexpected SET reply {}",
                other.describe()
            ))),
        }
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> BrokerResult<u64> {
        match self
            .request(Command::new("PUBLISH").arg(channel).arg(payload))
            .await?
        {
            RespValue::Integer(n) => Ok(u64::try_from(n).unwrap_or(0)),
            other => Err(BrokerError::Protocol(format!(
                "unexpected PUBLISH reply {}",
                other.describe()
            ))),
        }
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<Box<dyn Subscription>> {
        let mut conn = self.open().await?;
        conn.send(Command::new("SUBSCRIBE").arg(channel)).await?;
        Ok(Box::new(RedisSubscription {
            channel: channel.to_string(),
            conn: Some(conn),
        }))
    }

    fn endpoint(&self) -> String {
        format!("redis://{}", self.address)
    }
}

/// A subscription on its own Redis connection.
struct RedisSubscription {
    channel: String,
    conn: Option<Connection>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_event(&mut self) -> BrokerResult<PubSubEvent> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(BrokerError::ConnectionClosed);
        };
        match conn.next().await {
            Some(Ok(RespValue::Error(message))) => Err(BrokerError::Server(message)),
            Some(Ok(value)) => PubSubEvent::from_resp(value),
            Some(Err(e)) => Err(e),
            None => {
                self.conn = None;
                Err(BrokerError::ConnectionClosed)
            }
        }
    }

    async fn unsubscribe(&mut self) -> BrokerResult<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        conn.send(Command::new("UNSUBSCRIBE").arg(&self.channel))
            .await
    }

    async fn close(&mut self) -> BrokerResult<()> {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                warn!(channel = %self.channel, error = %e, "Error closing subscription connection");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// Serves one connection, answering each request with the next canned reply.
    async fn canned_server(replies: Vec<&'static [u8]>) -> BrokerAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            for reply in replies {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                socket.write_all(reply).await.unwrap();
            }
        });
        BrokerAddress::new("127.0.0.1", port)
    }

    /// Serves one connection per entry, each answering its requests with
    /// `(delay, reply)` pairs in order.
    async fn scripted_server(connections: Vec<Vec<(Duration, &'static [u8])>>) -> BrokerAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            for replies in connections {
                let (mut socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    for (delay, reply) in replies {
                        let n = socket.read(&mut buf).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        tokio::time::sleep(delay).await;
                        if socket.write_all(reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        BrokerAddress::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_get_set_publish_against_canned_server() {
        let address = canned_server(vec![
            &b"+PONG\r\n"[..],
            &b"$-1\r\n"[..],
            &b"+OK\r\n"[..],
            &b"$2\r\n{}\r\n"[..],
            &b":3\r\n"[..],
        ])
        .await;
        let broker = RedisBroker::connect(address).await.unwrap();
        assert_eq!(broker.get("tm-pids").await.unwrap(), None);
        broker.set("tm-pids", b"{}").await.unwrap();
        assert_eq!(broker.get("tm-pids").await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(broker.publish("chan", b"x").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_error_reply_is_server_error() {
        let address = canned_server(vec![&b"-WRONGTYPE bad\r\n"[..]]).await;
        let broker = RedisBroker::new(address);
        assert!(matches!(
            broker.get("k").await,
            Err(BrokerError::Server(m)) if m.contains("WRONGTYPE")
        ));
    }

    #[tokio::test]
    async fn test_closed_connection_is_dropped_and_reported() {
        let address = canned_server(vec![]).await;
        let broker = RedisBroker::new(address);
        let err = broker.get("k").await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(broker.conn.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_refused_connection_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let result = RedisBroker::connect(BrokerAddress::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(BrokerError::Io(_))));
    }

    #[tokio::test]
    async fn test_abandoned_get_does_not_leak_reply_into_next_command() {
        let address = scripted_server(vec![
            vec![(Duration::from_millis(300), &b"$2\r\n{}\r\n"[..])],
            vec![(Duration::ZERO, &b"+PONG\r\n"[..]), (Duration::ZERO, &b"$-1\r\n"[..])],
        ])
        .await;
        let broker = RedisBroker::new(address);

        let abandoned = timeout(Duration::from_millis(100), broker.get("tm-pids")).await;
        assert!(abandoned.is_err());
        assert!(broker.conn.lock().await.is_none());

        broker.ping().await.unwrap();
        assert_eq!(broker.get("tm-pids").await.unwrap(), None);
    }
}
