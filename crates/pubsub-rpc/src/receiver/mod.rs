//! Receiving side: RPC receivers and one-way consumers.

pub mod oneway;
pub mod rpc;

pub use oneway::{ByteMessageReceiver, ObjectMessageReceiver};
pub use rpc::{RpcByteReceiver, RpcObjectReceiver, RpcReceiver};
