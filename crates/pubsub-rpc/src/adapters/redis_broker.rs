//! # Redis Broker
//!
//! [`BrokerExecutions`] over a Redis server:
//! - `publish` issues `PUBLISH` on a shared multiplexed connection and
//!   returns the integer reply (number of subscribed clients)
//! - `subscribe` opens a dedicated pub/sub connection per subscription,
//!   since a connection in subscribed mode cannot issue other commands
//!
//! ```text
//!  publish ─► MultiplexedConnection (shared, cloned per call) ─► PUBLISH
//!  subscribe ─► aio::PubSub (one per subscriber loop)
//!                  SUBSCRIBE ch.. ─► on_subscribe(ch, n)
//!                  message stream ─► on_message(ch, payload)
//!                  UNSUBSCRIBE ch.. ─► on_unsubscribe(ch, n)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use tracing::{debug, info, trace, warn};

use crate::error::BrokerError;
use crate::ports::outbound::BrokerExecutions;
use crate::subscriber::PubSub;

/// Redis pub/sub broker.
pub struct RedisBroker {
    client: Client,

    /// Connection used for `PUBLISH`.
    connection: MultiplexedConnection,

    messages_published: AtomicU64,
}

impl RedisBroker {
    /// Connect to the server at `url` (e.g. `redis://127.0.0.1:6379/`).
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = Client::open(url).map_err(|e| BrokerError::Connection(e.to_string()))?;
        Self::from_client(client).await
    }

    /// Build on an already configured client.
    pub async fn from_client(client: Client) -> Result<Self, BrokerError> {
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        info!(server = ?client.get_connection_info().addr, "Redis broker connected");

        Ok(Self {
            client,
            connection,
            messages_published: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BrokerExecutions for RedisBroker {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, BrokerError> {
        let mut connection = self.connection.clone();
        let receivers: u64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut connection)
            .await
            .map_err(|e| broker_error(e, BrokerError::Publish))?;

        self.messages_published.fetch_add(1, Ordering::Relaxed);
        trace!(channel, receivers, bytes = payload.len(), "Message published");
        Ok(receivers)
    }

    async fn subscribe(&self, pubsub: Arc<PubSub>, channels: &[String]) -> Result<(), BrokerError> {
        let mut connection = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| broker_error(e, BrokerError::Subscribe))?;

        // SUBSCRIBE resolves on the server's confirmation; its count is the
        // number of channels this connection now holds
        for (index, channel) in channels.iter().enumerate() {
            connection
                .subscribe(channel.as_str())
                .await
                .map_err(|e| broker_error(e, BrokerError::Subscribe))?;
            pubsub.on_subscribe(channel, index + 1);
        }

        let closed = {
            let messages = connection.on_message();
            tokio::pin!(messages);
            let unsubscribed = pubsub.unsubscribed();
            tokio::pin!(unsubscribed);

            loop {
                tokio::select! {
                    biased;
                    message = messages.next() => match message {
                        Some(message) => pubsub.on_message(
                            message.get_channel_name(),
                            message.get_payload_bytes(),
                        ),
                        None => break true,
                    },
                    _ = &mut unsubscribed => break false,
                }
            }
        };

        if closed {
            warn!(subscription = %pubsub.name(), "Redis pub/sub connection dropped");
            for (index, channel) in channels.iter().enumerate() {
                pubsub.on_unsubscribe(channel, channels.len() - index - 1);
            }
            return Err(BrokerError::Closed);
        }

        for (index, channel) in channels.iter().enumerate() {
            connection
                .unsubscribe(channel.as_str())
                .await
                .map_err(|e| broker_error(e, BrokerError::Subscribe))?;
            pubsub.on_unsubscribe(channel, channels.len() - index - 1);
        }
        debug!(subscription = %pubsub.name(), "Redis subscription released");
        Ok(())
    }
}

/// Dropped connections are `Closed`; anything else keeps its message.
fn broker_error(error: RedisError, other: fn(String) -> BrokerError) -> BrokerError {
    if error.is_connection_dropped() || error.is_connection_refusal() {
        BrokerError::Closed
    } else {
        other(error.to_string())
    }
}
