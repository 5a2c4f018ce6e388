//! Payload flavors.
//!
//! The RPC engine is written once over [`Payload`]; the flavor decides how a
//! payload is placed in and recovered from an [`Envelope`].
//!
//! - [`BytePayload`]: opaque bytes as standard base64 strings
//! - [`ObjectPayload`]: typed objects as JSON subtrees tagged with `className`

use std::sync::Arc;

use serde_json::Value;

use crate::domain::envelope::{decode_bytes, encode_bytes, json_kind, keys, Envelope};
use crate::domain::object::{MessageObject, TypeRegistry};
use crate::error::ChannelError;
use crate::ports::outbound::ObjectCodec;

/// Encoding of request and response payloads inside an envelope.
pub trait Payload: Send + Sync + 'static {
    /// Decoded request or response value.
    type Message: Send + 'static;

    /// Borrowed form accepted by `send`.
    type Outgoing: ?Sized + Sync;

    fn write_message(
        &self,
        message: &Self::Outgoing,
        envelope: &mut Envelope,
    ) -> Result<(), ChannelError>;

    /// Decode `message`. An absent field is `ChannelError::EmptyMessage`.
    fn read_message(&self, envelope: &Envelope) -> Result<Self::Message, ChannelError>;

    fn write_response(
        &self,
        reply: &Self::Message,
        envelope: &mut Envelope,
    ) -> Result<(), ChannelError>;

    /// Decode `response`. An absent field is `ChannelError::EmptyResponse`.
    fn read_response(&self, envelope: &Envelope) -> Result<Self::Message, ChannelError>;
}

/// Opaque byte payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytePayload;

impl Payload for BytePayload {
    type Message = Vec<u8>;
    type Outgoing = [u8];

    fn write_message(&self, message: &[u8], envelope: &mut Envelope) -> Result<(), ChannelError> {
        envelope.message = Some(encode_bytes(message));
        Ok(())
    }

    fn read_message(&self, envelope: &Envelope) -> Result<Vec<u8>, ChannelError> {
        let value = envelope.message.as_ref().ok_or(ChannelError::EmptyMessage)?;
        decode_bytes(value)
    }

    fn write_response(&self, reply: &Vec<u8>, envelope: &mut Envelope) -> Result<(), ChannelError> {
        envelope.response = Some(encode_bytes(reply));
        Ok(())
    }

    fn read_response(&self, envelope: &Envelope) -> Result<Vec<u8>, ChannelError> {
        let value = envelope.response.as_ref().ok_or(ChannelError::EmptyResponse)?;
        decode_bytes(value)
    }
}

/// Typed object payloads, resolved through an [`ObjectCodec`].
///
/// Requests carry the tag both at the top level and inside `message`;
/// responses carry it at the top level only.
#[derive(Clone)]
pub struct ObjectPayload {
    codec: Arc<dyn ObjectCodec>,
}

impl ObjectPayload {
    pub fn new(codec: Arc<dyn ObjectCodec>) -> Self {
        Self { codec }
    }

    pub fn from_registry(registry: TypeRegistry) -> Self {
        Self::new(Arc::new(registry))
    }

    pub fn codec(&self) -> &Arc<dyn ObjectCodec> {
        &self.codec
    }

    /// Serialize `object` and stamp its class tag into the subtree.
    pub(crate) fn tagged(&self, object: &dyn MessageObject) -> Result<Value, ChannelError> {
        let mut value = self.codec.serialize(object)?;
        match &mut value {
            Value::Object(fields) => {
                fields.insert(keys::CLASS_NAME.to_string(), Value::from(object.class_name()));
                Ok(value)
            }
            other => Err(ChannelError::Serialization(format!(
                "{} must serialize to a JSON object, found {}",
                object.class_name(),
                json_kind(other)
            ))),
        }
    }

    pub(crate) fn decode(
        &self,
        class_name: &str,
        value: Value,
    ) -> Result<Box<dyn MessageObject>, ChannelError> {
        let tag = self
            .codec
            .resolve_tag(class_name)
            .ok_or_else(|| ChannelError::UnknownClass(class_name.to_string()))?;
        self.codec.deserialize(&tag, value)
    }
}

impl std::fmt::Debug for ObjectPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPayload").finish_non_exhaustive()
    }
}

impl Payload for ObjectPayload {
    type Message = Box<dyn MessageObject>;
    type Outgoing = dyn MessageObject;

    fn write_message(
        &self,
        message: &dyn MessageObject,
        envelope: &mut Envelope,
    ) -> Result<(), ChannelError> {
        envelope.message = Some(self.tagged(message)?);
        envelope.class_name = Some(message.class_name().to_string());
        Ok(())
    }

    fn read_message(&self, envelope: &Envelope) -> Result<Box<dyn MessageObject>, ChannelError> {
        let value = envelope.message.as_ref().ok_or(ChannelError::EmptyMessage)?;
        let class_name = value
            .get(keys::CLASS_NAME)
            .and_then(Value::as_str)
            .or(envelope.class_name.as_deref())
            .ok_or(ChannelError::MissingClassName)?;
        self.decode(class_name, value.clone())
    }

    fn write_response(
        &self,
        reply: &Box<dyn MessageObject>,
        envelope: &mut Envelope,
    ) -> Result<(), ChannelError> {
        envelope.response = Some(self.codec.serialize(reply.as_ref())?);
        envelope.class_name = Some(reply.class_name().to_string());
        Ok(())
    }

    fn read_response(&self, envelope: &Envelope) -> Result<Box<dyn MessageObject>, ChannelError> {
        let value = envelope.response.as_ref().ok_or(ChannelError::EmptyResponse)?;
        let class_name = envelope
            .class_name
            .as_deref()
            .ok_or(ChannelError::MissingClassName)?;
        self.decode(class_name, value.clone())
    }
}
