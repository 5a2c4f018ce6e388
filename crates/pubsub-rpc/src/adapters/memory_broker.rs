//! # In-Memory Broker
//!
//! Single-process broker with Redis pub/sub semantics:
//! - `publish` returns the number of subscriptions the message reached
//! - messages published while nobody listens are dropped
//! - each subscription sees its messages in publish order
//!
//! Suitable for tests and single-node operation. A networked deployment
//! plugs a real broker client in behind the same trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::BrokerError;
use crate::ports::outbound::BrokerExecutions;
use crate::subscriber::PubSub;

/// One message queued for a subscription.
struct Delivery {
    channel: String,
    payload: Arc<[u8]>,
}

/// A subscription registered on one channel.
struct Slot {
    subscription_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// In-memory pub/sub broker.
pub struct InMemoryBroker {
    /// Registered subscriptions by channel name.
    channels: RwLock<HashMap<String, Vec<Slot>>>,

    next_subscription_id: AtomicU64,

    /// Total messages published, delivered or not.
    messages_published: AtomicU64,

    closed: AtomicBool,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
            messages_published: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of subscriptions currently listening on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    /// Tear the broker down. Active subscriptions end with `BrokerError::Closed`
    /// and later calls fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.channels.write().clear();
        debug!("In-memory broker closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn deregister(&self, subscription_id: u64, channels: &[String]) {
        let mut map = self.channels.write();
        for channel in channels {
            if let Some(slots) = map.get_mut(channel) {
                slots.retain(|slot| slot.subscription_id != subscription_id);
                if slots.is_empty() {
                    map.remove(channel);
                }
            }
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerExecutions for InMemoryBroker {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        self.messages_published.fetch_add(1, Ordering::Relaxed);

        let payload: Arc<[u8]> = Arc::from(payload);
        let receivers = self.channels.read().get(channel).map_or(0, |slots| {
            slots
                .iter()
                .filter(|slot| {
                    slot.tx
                        .send(Delivery {
                            channel: channel.to_string(),
                            payload: payload.clone(),
                        })
                        .is_ok()
                })
                .count()
        });

        trace!(channel, receivers, bytes = payload.len(), "Message published");
        Ok(receivers as u64)
    }

    async fn subscribe(&self, pubsub: Arc<PubSub>, channels: &[String]) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let subscription_id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut map = self.channels.write();
            for channel in channels {
                map.entry(channel.clone()).or_default().push(Slot {
                    subscription_id,
                    tx: tx.clone(),
                });
            }
        }
        // Only the registered slots keep the queue open
        drop(tx);

        for (index, channel) in channels.iter().enumerate() {
            pubsub.on_subscribe(channel, index + 1);
        }

        let unsubscribed = pubsub.unsubscribed();
        tokio::pin!(unsubscribed);

        let closed = loop {
            // Queued messages are delivered before the unsubscribe is honoured
            tokio::select! {
                biased;
                delivery = rx.recv() => match delivery {
                    Some(delivery) => pubsub.on_message(&delivery.channel, &delivery.payload),
                    None => break true,
                },
                _ = &mut unsubscribed => break false,
            }
        };

        self.deregister(subscription_id, channels);
        for (index, channel) in channels.iter().enumerate() {
            pubsub.on_unsubscribe(channel, channels.len() - index - 1);
        }

        if closed {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::inbound::{LifecycleHooks, MessageListener};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl MessageListener for Collect {
        fn on_message(&self, _channel: &str, payload: &[u8]) {
            self.seen.lock().push(payload.to_vec());
        }
    }

    async fn wait_for_subscribers(broker: &InMemoryBroker, channel: &str, count: usize) {
        while broker.subscriber_count(channel) < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_publish_no_subscribers() {
        let broker = InMemoryBroker::new();
        assert_eq!(broker.publish("nobody", b"x").await.unwrap(), 0);
        assert_eq!(broker.messages_published(), 1);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let broker = Arc::new(InMemoryBroker::new());
        let channels = vec!["chan".to_string()];

        let mut tasks = Vec::new();
        let mut listeners = Vec::new();
        let mut handles = Vec::new();
        for i in 0..3 {
            let listener = Arc::new(Collect::default());
            let pubsub = Arc::new(PubSub::new(
                format!("sub-{i}"),
                listener.clone(),
                LifecycleHooks::new(),
                1,
            ));
            let (broker, channels, handle) = (broker.clone(), channels.clone(), pubsub.clone());
            tasks.push(tokio::spawn(async move { broker.subscribe(handle, &channels).await }));
            listeners.push(listener);
            handles.push(pubsub);
        }
        wait_for_subscribers(&broker, "chan", 3).await;

        assert_eq!(broker.publish("chan", b"a").await.unwrap(), 3);
        assert_eq!(broker.publish("chan", b"b").await.unwrap(), 3);

        for pubsub in &handles {
            pubsub.unsubscribe();
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        for listener in listeners {
            assert_eq!(*listener.seen.lock(), vec![b"a".to_vec(), b"b".to_vec()]);
        }
        assert_eq!(broker.subscriber_count("chan"), 0);
    }

    #[tokio::test]
    async fn test_close_ends_subscription() {
        let broker = Arc::new(InMemoryBroker::new());
        let pubsub = Arc::new(PubSub::new(
            "sub",
            Arc::new(Collect::default()),
            LifecycleHooks::new(),
            1,
        ));
        let task = {
            let (broker, pubsub) = (broker.clone(), pubsub.clone());
            tokio::spawn(async move { broker.subscribe(pubsub, &["chan".to_string()]).await })
        };
        wait_for_subscribers(&broker, "chan", 1).await;

        broker.close();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("subscription ends")
            .unwrap();
        assert_eq!(result, Err(BrokerError::Closed));
        assert_eq!(broker.publish("chan", b"x").await, Err(BrokerError::Closed));
    }
}
