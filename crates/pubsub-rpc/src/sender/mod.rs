//! Sending side: RPC senders and one-way publishers.

pub mod oneway;
pub mod rpc;

pub use oneway::{ByteMessageSender, ObjectMessageSender};
pub use rpc::{RpcByteSender, RpcObjectSender, RpcSender};
