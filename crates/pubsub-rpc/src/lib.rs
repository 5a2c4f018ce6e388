//! # Pub/Sub RPC - Request/Response Messaging over a Pub/Sub Broker
//!
//! Correlation-based RPC on top of a fire-and-forget pub/sub broker. A
//! logical channel `C` maps to two wire channels: requests flow on
//! `C:sender`, responses on `C:receiver`.
//!
//! ## Architecture
//!
//! ```text
//!   caller                                                   handler
//!     │                                                         ▲
//! ┌───┴──────────────┐    C:sender     ┌────────────┐   ┌───────┴─────────┐
//! │  RpcSender<P>    │ ──────────────► │   Broker   │ ─►│ RpcReceiver<P>  │
//! │  CorrelationTable│ ◄────────────── │ (pub/sub)  │ ◄─│ per-request task│
//! └──────────────────┘   C:receiver    └────────────┘   └─────────────────┘
//! ```
//!
//! - **domain/**: envelope codec, correlation ids, correlation table, typed objects, config
//! - **ports/**: broker and codec seams, handler and lifecycle callbacks
//! - **adapters/**: in-memory broker with Redis pub/sub semantics, and a
//!   Redis client adapter behind the `redis` feature
//! - **subscriber**: one task per subscription, delivering in broker order
//! - **sender/**, **receiver/**: RPC endpoints plus one-way publishers and consumers
//!
//! ## Payload Flavors
//!
//! - [`BytePayload`]: opaque bytes, carried as standard base64
//! - [`ObjectPayload`]: typed values resolved through a [`TypeRegistry`]
//!
//! ## Usage
//!
//! ```ignore
//! use pubsub_rpc::{InMemoryBroker, RpcByteReceiver, RpcByteSender};
//!
//! let broker = Arc::new(InMemoryBroker::new());
//! let receiver = RpcByteReceiver::new(broker.clone(), "rpc:echo", |bytes: Vec<u8>| async move {
//!     Ok(bytes)
//! });
//! receiver.start()?;
//! receiver.ready().await?;
//!
//! let sender = RpcByteSender::new(broker, "rpc:echo");
//! sender.start()?;
//! sender.ready().await?;
//! let response = sender.send(b"ping").await?;
//! ```

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]
#![deny(unsafe_code)]

pub mod adapters;
pub mod domain;
pub mod error;
pub mod payload;
pub mod ports;
pub mod receiver;
pub mod sender;
pub mod subscriber;

// Re-export main types
pub use adapters::InMemoryBroker;
#[cfg(feature = "redis")]
pub use adapters::RedisBroker;
pub use domain::pending::{Completion, Outcome};
pub use domain::{
    ChannelPair, CorrelationId, CorrelationTable, Envelope, MessageObject, MessageStatus,
    MessageType, RpcConfig, RpcResponse, TableStats, TypeRegistry, TypeTag,
};
pub use error::{BrokerError, ChannelError, ConfigError, HandlerError, MessageError};
pub use payload::{BytePayload, ObjectPayload, Payload};
pub use ports::{
    BrokerExecutions, LifecycleHooks, MessageConsumer, MessageListener, ObjectCodec, RpcHandler,
};
pub use receiver::{
    ByteMessageReceiver, ObjectMessageReceiver, RpcByteReceiver, RpcObjectReceiver, RpcReceiver,
};
pub use sender::{
    ByteMessageSender, ObjectMessageSender, RpcByteSender, RpcObjectSender, RpcSender,
};
pub use subscriber::{LoopState, PubSub, SubscriberLoop};
