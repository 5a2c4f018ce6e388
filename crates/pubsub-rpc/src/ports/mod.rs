//! Ports (trait seams) of the messaging core.

pub mod inbound;
pub mod outbound;

pub use inbound::{LifecycleHooks, MessageConsumer, MessageListener, RpcHandler};
pub use outbound::{BrokerExecutions, ObjectCodec};
