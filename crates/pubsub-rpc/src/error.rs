//! Error types for the RPC messaging layer

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a broker collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker connection is gone.
    #[error("Broker closed")]
    Closed,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Connection failed: {0}")]
    Connection(String),
}

/// Errors surfaced by senders, receivers and the envelope codec.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("No response within local timeout of {}ms", timeout.as_millis())]
    LocalTimeout { timeout: Duration },

    #[error("Handler did not complete within remote timeout of {}ms", timeout.as_millis())]
    RemoteTimeout { timeout: Duration },

    #[error("Empty response received")]
    EmptyResponse,

    #[error("Empty message received")]
    EmptyMessage,

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Class {0} of received message not found")]
    UnknownClass(String),

    #[error("Received typed message without a className")]
    MissingClassName,

    #[error("{0}")]
    Handler(HandlerError),

    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("Response waiter dropped before completion")]
    WaiterDropped,

    #[error("Channel is shut down")]
    Shutdown,

    #[error("Channel already started")]
    AlreadyStarted,

    #[error("Channel not started")]
    NotStarted,

    #[error("No tokio runtime available: {0}")]
    Runtime(String),
}

impl ChannelError {
    /// Stable tag written to `errorClassName` when this error is reported remotely.
    pub fn class_name(&self) -> &str {
        match self {
            Self::Broker(_) => "BrokerError",
            Self::LocalTimeout { .. } => "LocalTimeout",
            Self::RemoteTimeout { .. } => REMOTE_TIMEOUT_CLASS,
            Self::EmptyResponse => "EmptyResponse",
            Self::EmptyMessage => "EmptyMessage",
            Self::Base64(_) => "Base64DecodeError",
            Self::Json(_) => "MalformedEnvelope",
            Self::Serialization(_) => "SerializationError",
            Self::UnknownClass(_) => "UnknownClass",
            Self::MissingClassName => "MissingClassName",
            Self::Handler(e) => &e.class_name,
            Self::HandlerPanicked(_) => "HandlerPanicked",
            Self::WaiterDropped => "WaiterDropped",
            Self::Shutdown => "Shutdown",
            Self::AlreadyStarted => "AlreadyStarted",
            Self::NotStarted => "NotStarted",
            Self::Runtime(_) => "Runtime",
        }
    }

    /// Remote error descriptor carried back to the sender.
    pub fn to_message_error(&self) -> MessageError {
        let message = match self {
            Self::Handler(e) => e.message.clone(),
            other => other.to_string(),
        };
        MessageError::new(Some(self.class_name().to_string()), Some(message))
    }
}

/// Tag used for errors produced when a handler exceeds its remote timeout.
pub const REMOTE_TIMEOUT_CLASS: &str = "RemoteTimeout";

/// Failure returned by a user handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub class_name: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            class_name: "HandlerError".to_string(),
            message: message.into(),
        }
    }

    pub fn with_class(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
        }
    }

    /// Build from any error, tagging it with the error's type path.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        Self {
            class_name: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class_name, self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<HandlerError> for ChannelError {
    fn from(error: HandlerError) -> Self {
        Self::Handler(error)
    }
}

/// Error descriptor received from the remote side (`errorClassName`, `errorMessage`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageError {
    pub class_name: Option<String>,
    pub message: Option<String>,
}

impl MessageError {
    pub fn new(class_name: Option<String>, message: Option<String>) -> Self {
        Self {
            class_name,
            message,
        }
    }

    /// True when the remote handler was cut off by its remote timeout.
    pub fn is_remote_timeout(&self) -> bool {
        self.class_name.as_deref() == Some(REMOTE_TIMEOUT_CLASS)
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.class_name, &self.message) {
            (Some(class), Some(message)) => write!(f, "{class}: {message}"),
            (Some(class), None) => write!(f, "{class}"),
            (None, Some(message)) => write!(f, "{message}"),
            (None, None) => write!(f, "unknown remote error"),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),
}
