//! One-way receivers. Each delivered message is handed to the consumer on
//! the subscriber task.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::domain::envelope::{keys, Envelope};
use crate::domain::object::{MessageObject, TypeRegistry};
use crate::error::ChannelError;
use crate::payload::ObjectPayload;
use crate::ports::inbound::{LifecycleHooks, MessageConsumer, MessageListener};
use crate::ports::outbound::{BrokerExecutions, ObjectCodec};
use crate::subscriber::SubscriberLoop;

macro_rules! lifecycle {
    () => {
        pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
            self.subscriber = self.subscriber.with_hooks(hooks);
            self
        }

        pub fn with_shutdown_grace(mut self, shutdown_grace: std::time::Duration) -> Self {
            self.subscriber = self.subscriber.with_shutdown_grace(shutdown_grace);
            self
        }

        pub fn channel(&self) -> &str {
            &self.subscriber.channels()[0]
        }

        pub async fn ready(&self) -> Result<(), ChannelError> {
            self.subscriber.ready().await
        }

        pub fn shutdown(&self) {
            self.subscriber.shutdown();
        }

        pub async fn join(&self) {
            self.subscriber.join().await;
        }

        pub fn is_shutdown(&self) -> bool {
            self.subscriber.is_shutdown()
        }
    };
}

/// Delivers raw payloads from one channel.
pub struct ByteMessageReceiver {
    consumer: Arc<dyn MessageConsumer<Vec<u8>>>,
    subscriber: SubscriberLoop,
}

impl ByteMessageReceiver {
    pub fn new(
        broker: Arc<dyn BrokerExecutions>,
        channel: impl Into<String>,
        consumer: impl MessageConsumer<Vec<u8>>,
    ) -> Self {
        let channel = channel.into();
        Self {
            consumer: Arc::new(consumer),
            subscriber: SubscriberLoop::new(format!("{channel}-receiver"), broker, vec![channel]),
        }
    }

    lifecycle!();

    pub fn start(&self) -> Result<(), ChannelError> {
        self.subscriber.start(Arc::new(ByteDelivery {
            consumer: self.consumer.clone(),
        }))?;
        info!(channel = %self.channel(), "Byte message receiver started");
        Ok(())
    }
}

struct ByteDelivery {
    consumer: Arc<dyn MessageConsumer<Vec<u8>>>,
}

impl MessageListener for ByteDelivery {
    fn on_message(&self, _channel: &str, payload: &[u8]) {
        self.consumer.receive(payload.to_vec());
    }
}

/// Delivers typed objects published as `{className, message}` envelopes.
pub struct ObjectMessageReceiver {
    payload: ObjectPayload,
    consumer: Arc<dyn MessageConsumer<Box<dyn MessageObject>>>,
    subscriber: SubscriberLoop,
}

impl ObjectMessageReceiver {
    pub fn new(
        broker: Arc<dyn BrokerExecutions>,
        channel: impl Into<String>,
        codec: Arc<dyn ObjectCodec>,
        consumer: impl MessageConsumer<Box<dyn MessageObject>>,
    ) -> Self {
        let channel = channel.into();
        Self {
            payload: ObjectPayload::new(codec),
            consumer: Arc::new(consumer),
            subscriber: SubscriberLoop::new(format!("{channel}-receiver"), broker, vec![channel]),
        }
    }

    pub fn from_registry(
        broker: Arc<dyn BrokerExecutions>,
        channel: impl Into<String>,
        registry: TypeRegistry,
        consumer: impl MessageConsumer<Box<dyn MessageObject>>,
    ) -> Self {
        Self::new(broker, channel, Arc::new(registry), consumer)
    }

    lifecycle!();

    pub fn start(&self) -> Result<(), ChannelError> {
        self.subscriber.start(Arc::new(ObjectDelivery {
            payload: self.payload.clone(),
            consumer: self.consumer.clone(),
        }))?;
        info!(channel = %self.channel(), "Object message receiver started");
        Ok(())
    }
}

struct ObjectDelivery {
    payload: ObjectPayload,
    consumer: Arc<dyn MessageConsumer<Box<dyn MessageObject>>>,
}

impl ObjectDelivery {
    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn MessageObject>, ChannelError> {
        let mut envelope = Envelope::from_slice(bytes)?;
        let message = envelope.message.take().ok_or(ChannelError::EmptyMessage)?;
        let class_name = envelope
            .class_name
            .take()
            .or_else(|| {
                message
                    .get(keys::CLASS_NAME)
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .ok_or(ChannelError::MissingClassName)?;
        self.payload.decode(&class_name, message)
    }
}

impl MessageListener for ObjectDelivery {
    fn on_message(&self, channel: &str, bytes: &[u8]) {
        match self.decode(bytes) {
            Ok(object) => self.consumer.receive(object),
            Err(e) => warn!(channel, error = %e, "Dropping undecodable message"),
        }
    }
}
