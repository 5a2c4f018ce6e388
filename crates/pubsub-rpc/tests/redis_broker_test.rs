//! RPC over a live Redis server.
//!
//! Runs only with the `redis` feature and `RPC_REDIS_URL` pointing at a
//! server (e.g. `redis://127.0.0.1:6379/`); otherwise each test returns early.

#![cfg(feature = "redis")]

use std::sync::Arc;
use std::time::Duration;

use pubsub_rpc::{
    BrokerExecutions, CorrelationId, HandlerError, MessageStatus, RedisBroker, RpcByteReceiver,
    RpcByteSender,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn redis_broker() -> Option<Arc<RedisBroker>> {
    rpc_telemetry::init_test_logging();
    let url = std::env::var("RPC_REDIS_URL").ok()?;
    Some(Arc::new(RedisBroker::connect(&url).await.unwrap()))
}

fn unique_channel(prefix: &str) -> String {
    format!("{prefix}:{}", CorrelationId::new())
}

#[tokio::test]
async fn test_publish_without_subscribers_reports_zero() {
    let Some(broker) = redis_broker().await else {
        return;
    };
    let channel = unique_channel("rpc:redis:nobody");
    assert_eq!(broker.publish(&channel, b"x").await.unwrap(), 0);
    assert_eq!(broker.messages_published(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_byte_rpc_over_redis() {
    let Some(broker) = redis_broker().await else {
        return;
    };
    let channel = unique_channel("rpc:redis:echo");

    let receiver =
        RpcByteReceiver::new(broker.clone(), channel.clone(), |bytes: Vec<u8>| async move {
            Ok::<_, HandlerError>(bytes.into_iter().rev().collect())
        });
    receiver.start().unwrap();
    timeout(WAIT, receiver.ready()).await.unwrap().unwrap();

    let sender = RpcByteSender::new(broker.clone(), channel);
    sender.start().unwrap();
    timeout(WAIT, sender.ready()).await.unwrap().unwrap();

    let response = timeout(WAIT, sender.send(b"abc")).await.unwrap().unwrap();
    assert_eq!(response.status, MessageStatus::Success);
    assert_eq!(response.response, Some(b"cba".to_vec()));
    assert_eq!(sender.pending_count(), 0);

    sender.shutdown();
    receiver.shutdown();
    timeout(WAIT, sender.join()).await.unwrap();
    timeout(WAIT, receiver.join()).await.unwrap();
}
