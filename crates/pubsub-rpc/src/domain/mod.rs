//! Domain layer - envelope codec, correlation, configuration and typed objects.

pub mod config;
pub mod correlation;
pub mod envelope;
pub mod object;
pub mod pending;

pub use config::RpcConfig;
pub use correlation::CorrelationId;
pub use envelope::{ChannelPair, Envelope};
pub use object::{MessageObject, MessageType, TypeRegistry, TypeTag};
pub use pending::{CorrelationTable, MessageStatus, RpcResponse, TableStats};
