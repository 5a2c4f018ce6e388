//! Typed message objects and the registry that resolves their class tags.
//!
//! A receiver only accepts tags that were registered up front; nothing is
//! resolved dynamically from the wire.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::domain::envelope::{json_kind, keys};
use crate::error::ChannelError;
use crate::ports::outbound::ObjectCodec;

/// A concrete payload type that can travel in a typed envelope.
///
/// `CLASS_NAME` is the fully-qualified tag written to `className`.
pub trait MessageType: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    const CLASS_NAME: &'static str;
}

/// Object-safe view of a typed payload.
pub trait MessageObject: fmt::Debug + Send + Sync + 'static {
    fn class_name(&self) -> &'static str;

    /// Serialize to the JSON subtree carried on the wire.
    fn to_json(&self) -> Result<Value, serde_json::Error>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: MessageType> MessageObject for T {
    fn class_name(&self) -> &'static str {
        T::CLASS_NAME
    }

    fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl dyn MessageObject {
    pub fn is<T: MessageType>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: MessageType>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Recover the concrete type, handing the box back on mismatch.
    pub fn downcast<T: MessageType>(self: Box<Self>) -> Result<Box<T>, Box<Self>> {
        if !self.is::<T>() {
            return Err(self);
        }
        // `is::<T>()` holds, so the Any downcast cannot fail
        Ok(self
            .into_any()
            .downcast::<T>()
            .unwrap_or_else(|_| unreachable!("type id checked before downcast")))
    }
}

type DecodeFn = fn(Value) -> Result<Box<dyn MessageObject>, serde_json::Error>;

/// Resolved class tag: the registered name plus its decoder.
#[derive(Clone, Copy)]
pub struct TypeTag {
    class_name: &'static str,
    decode: DecodeFn,
}

impl TypeTag {
    pub fn of<T: MessageType>() -> Self {
        Self {
            class_name: T::CLASS_NAME,
            decode: decode_as::<T>,
        }
    }

    pub fn class_name(&self) -> &'static str {
        self.class_name
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypeTag").field(&self.class_name).finish()
    }
}

fn decode_as<T: MessageType>(value: Value) -> Result<Box<dyn MessageObject>, serde_json::Error> {
    let object: T = serde_json::from_value(value)?;
    Ok(Box::new(object))
}

/// Registry of the typed payloads a process accepts.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    tags: HashMap<&'static str, TypeTag>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its `CLASS_NAME`. Re-registering replaces the entry.
    pub fn register<T: MessageType>(&mut self) -> &mut Self {
        self.tags.insert(T::CLASS_NAME, TypeTag::of::<T>());
        self
    }

    /// Builder-style `register`.
    pub fn with<T: MessageType>(mut self) -> Self {
        self.register::<T>();
        self
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.tags.contains_key(class_name)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl ObjectCodec for TypeRegistry {
    fn serialize(&self, object: &dyn MessageObject) -> Result<Value, ChannelError> {
        let value = object
            .to_json()
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;
        if !value.is_object() {
            return Err(ChannelError::Serialization(format!(
                "{} must serialize to a JSON object, found {}",
                object.class_name(),
                json_kind(&value)
            )));
        }
        Ok(value)
    }

    fn resolve_tag(&self, class_name: &str) -> Option<TypeTag> {
        self.tags.get(class_name).copied()
    }

    fn deserialize(
        &self,
        tag: &TypeTag,
        mut value: Value,
    ) -> Result<Box<dyn MessageObject>, ChannelError> {
        if let Value::Object(fields) = &mut value {
            fields.remove(keys::CLASS_NAME);
        }
        (tag.decode)(value).map_err(|e| {
            ChannelError::Serialization(format!("cannot decode {}: {e}", tag.class_name))
        })
    }
}
