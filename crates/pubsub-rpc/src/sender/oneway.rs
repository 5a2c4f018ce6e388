//! One-way publishers. No correlation, no response.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::envelope::Envelope;
use crate::domain::object::{MessageObject, TypeRegistry};
use crate::domain::pending::MessageStatus;
use crate::error::ChannelError;
use crate::payload::ObjectPayload;
use crate::ports::outbound::{BrokerExecutions, ObjectCodec};

fn status_for(channel: &str, receivers: u64) -> MessageStatus {
    if receivers == 0 {
        warn!(channel, "No subscribers on channel");
        MessageStatus::NotSubscribersChannel
    } else {
        debug!(channel, receivers, "Message published");
        MessageStatus::Success
    }
}

/// Publishes raw bytes on a channel, as is.
pub struct ByteMessageSender {
    channel: String,
    broker: Arc<dyn BrokerExecutions>,
}

impl ByteMessageSender {
    pub fn new(broker: Arc<dyn BrokerExecutions>, channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            broker,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn send(&self, message: &[u8]) -> Result<MessageStatus, ChannelError> {
        let receivers = self.broker.publish(&self.channel, message).await?;
        Ok(status_for(&self.channel, receivers))
    }
}

/// Publishes typed objects as `{className, message}` envelopes.
pub struct ObjectMessageSender {
    channel: String,
    broker: Arc<dyn BrokerExecutions>,
    payload: ObjectPayload,
}

impl ObjectMessageSender {
    pub fn new(
        broker: Arc<dyn BrokerExecutions>,
        channel: impl Into<String>,
        codec: Arc<dyn ObjectCodec>,
    ) -> Self {
        Self {
            channel: channel.into(),
            broker,
            payload: ObjectPayload::new(codec),
        }
    }

    pub fn from_registry(
        broker: Arc<dyn BrokerExecutions>,
        channel: impl Into<String>,
        registry: TypeRegistry,
    ) -> Self {
        Self::new(broker, channel, Arc::new(registry))
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn send(&self, message: &dyn MessageObject) -> Result<MessageStatus, ChannelError> {
        let envelope = Envelope {
            class_name: Some(message.class_name().to_string()),
            message: Some(self.payload.tagged(message)?),
            ..Envelope::default()
        };
        let receivers = self.broker.publish(&self.channel, &envelope.to_vec()?).await?;
        Ok(status_for(&self.channel, receivers))
    }
}
