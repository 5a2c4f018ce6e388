//! Adapters (Driven side)
//!
//! Broker implementations of [`crate::ports::outbound::BrokerExecutions`].
//!
//! - [`InMemoryBroker`]: single-process, always available
//! - `RedisBroker`: networked Redis pub/sub, behind the `redis` feature

pub mod memory_broker;
#[cfg(feature = "redis")]
pub mod redis_broker;

pub use memory_broker::InMemoryBroker;
#[cfg(feature = "redis")]
pub use redis_broker::RedisBroker;
