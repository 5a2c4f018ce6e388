//! Outbound Ports (Driven Ports)
//!
//! Collaborators the messaging core depends on but does not implement:
//! the pub/sub broker connection and the typed-object codec.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::object::{MessageObject, TypeTag};
use crate::error::{BrokerError, ChannelError};
use crate::subscriber::PubSub;

/// Broker connection (Driven Port)
///
/// Connection pooling, reconnection and transport framing live behind this
/// trait. Each call must be independently safe to issue from any task.
#[async_trait]
pub trait BrokerExecutions: Send + Sync + 'static {
    /// Publish `payload` on `channel`.
    ///
    /// # Returns
    ///
    /// The number of subscribers the broker delivered the message to.
    /// Zero means nobody is listening on the channel.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, BrokerError>;

    /// Subscribe `pubsub` to `channels`.
    ///
    /// Must call `pubsub.on_subscribe` once per channel as the broker confirms
    /// it, deliver every message through `pubsub.on_message` in arrival order,
    /// and resolve only after `pubsub.unsubscribe()` has been signalled (calling
    /// `on_unsubscribe` per channel on the way out).
    async fn subscribe(&self, pubsub: Arc<PubSub>, channels: &[String]) -> Result<(), BrokerError>;
}

/// Typed payload codec (Driven Port)
pub trait ObjectCodec: Send + Sync + 'static {
    /// Serialize a typed payload to the JSON subtree carried on the wire.
    fn serialize(&self, object: &dyn MessageObject) -> Result<Value, ChannelError>;

    /// Resolve a wire class tag; `None` when the tag is not accepted.
    fn resolve_tag(&self, class_name: &str) -> Option<TypeTag>;

    /// Deserialize a JSON subtree under a resolved tag.
    fn deserialize(
        &self,
        tag: &TypeTag,
        value: Value,
    ) -> Result<Box<dyn MessageObject>, ChannelError>;
}
