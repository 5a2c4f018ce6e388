//! # RPC Sender
//!
//! Publishes requests on `C:sender` and matches responses arriving on
//! `C:receiver` back to their callers by correlation id.
//!
//! ```text
//!  send() ─reserve─► [CorrelationTable] ◄─complete─ ResponseListener ◄─ C:receiver
//!     │                                                  (subscriber task)
//!     └─publish─► C:sender
//! ```

use std::sync::Arc;
use std::time::Duration;

use rpc_telemetry::{log_correlated_event, log_rpc_event};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::domain::config::RpcConfig;
use crate::domain::envelope::{salvage_correlation, ChannelPair, CorrelationError, Envelope};
use crate::domain::object::TypeRegistry;
use crate::domain::pending::{
    Completion, CorrelationTable, ReleaseGuard, RpcResponse, TableStats,
};
use crate::error::{BrokerError, ChannelError};
use crate::payload::{BytePayload, ObjectPayload, Payload};
use crate::ports::inbound::{LifecycleHooks, MessageListener};
use crate::ports::outbound::{BrokerExecutions, ObjectCodec};
use crate::subscriber::{LoopState, SubscriberLoop};

/// Sender of byte RPCs.
pub type RpcByteSender = RpcSender<BytePayload>;

/// Sender of typed-object RPCs.
pub type RpcObjectSender = RpcSender<ObjectPayload>;

/// Client side of one logical RPC channel.
pub struct RpcSender<P: Payload> {
    channels: ChannelPair,
    broker: Arc<dyn BrokerExecutions>,
    payload: Arc<P>,
    table: Arc<CorrelationTable<P::Message>>,
    config: RpcConfig,
    subscriber: SubscriberLoop,
}

impl RpcSender<BytePayload> {
    pub fn new(broker: Arc<dyn BrokerExecutions>, channel: impl Into<String>) -> Self {
        Self::with_payload(broker, channel, BytePayload)
    }
}

impl RpcSender<ObjectPayload> {
    pub fn new(
        broker: Arc<dyn BrokerExecutions>,
        channel: impl Into<String>,
        codec: Arc<dyn ObjectCodec>,
    ) -> Self {
        Self::with_payload(broker, channel, ObjectPayload::new(codec))
    }

    pub fn from_registry(
        broker: Arc<dyn BrokerExecutions>,
        channel: impl Into<String>,
        registry: TypeRegistry,
    ) -> Self {
        Self::with_payload(broker, channel, ObjectPayload::from_registry(registry))
    }
}

impl<P: Payload> RpcSender<P> {
    pub fn with_payload(
        broker: Arc<dyn BrokerExecutions>,
        channel: impl Into<String>,
        payload: P,
    ) -> Self {
        let channels = ChannelPair::new(channel);
        let config = RpcConfig::default();
        let subscriber = SubscriberLoop::new(
            format!("{}-response-receiver", channels.logical()),
            broker.clone(),
            vec![channels.receiver().to_string()],
        )
        .with_shutdown_grace(config.shutdown_grace);

        Self {
            channels,
            broker,
            payload: Arc::new(payload),
            table: Arc::new(CorrelationTable::new()),
            config,
            subscriber,
        }
    }

    pub fn with_config(mut self, config: RpcConfig) -> Self {
        self.subscriber = self.subscriber.with_shutdown_grace(config.shutdown_grace);
        self.config = config;
        self
    }

    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.subscriber = self.subscriber.with_hooks(hooks);
        self
    }

    pub fn channels(&self) -> &ChannelPair {
        &self.channels
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Start listening for responses on `C:receiver`.
    ///
    /// If the response subscription is later lost, callers still waiting
    /// fail with the broker error.
    pub fn start(&self) -> Result<(), ChannelError> {
        let listener = Arc::new(ResponseListener {
            channel: self.channels.receiver().to_string(),
            payload: self.payload.clone(),
            table: self.table.clone(),
        });
        self.subscriber.start(listener)?;

        let table = self.table.clone();
        let channel = self.channels.logical().to_string();
        self.subscriber.on_failure(move |error| {
            let aborted = table.abort_pending_with(|| ChannelError::Broker(error.clone()));
            log_rpc_event!(
                warn,
                channel,
                "Response subscription lost, pending requests failed",
                error = %error,
                aborted
            );
        })?;

        info!(channel = %self.channels.logical(), "RPC sender started");
        Ok(())
    }

    /// Resolves once the response subscription is confirmed by the broker.
    pub async fn ready(&self) -> Result<(), ChannelError> {
        self.subscriber.ready().await
    }

    /// Stop listening for responses. Callers still waiting fail with
    /// `ChannelError::Shutdown`; later sends are rejected.
    pub fn shutdown(&self) {
        self.subscriber.shutdown();
        self.table.abort_pending();
    }

    pub async fn join(&self) {
        self.subscriber.join().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.subscriber.is_shutdown()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.table.pending_count()
    }

    pub fn stats(&self) -> &TableStats {
        self.table.stats()
    }

    /// Send with the configured default timeouts.
    pub async fn send(
        &self,
        message: &P::Outgoing,
    ) -> Result<RpcResponse<P::Message>, ChannelError> {
        self.send_with_timeouts(
            message,
            self.config.default_local_timeout,
            self.config.default_remote_timeout,
        )
        .await
    }

    /// Send, waiting at most `local_timeout` for the response.
    pub async fn send_timeout(
        &self,
        message: &P::Outgoing,
        local_timeout: Duration,
    ) -> Result<RpcResponse<P::Message>, ChannelError> {
        self.send_with_timeouts(message, local_timeout, self.config.default_remote_timeout)
            .await
    }

    /// Send, asking the receiver to bound its handler by `remote_timeout`.
    pub async fn send_with_remote_timeout(
        &self,
        message: &P::Outgoing,
        remote_timeout: Duration,
    ) -> Result<RpcResponse<P::Message>, ChannelError> {
        self.send_with_timeouts(message, self.config.default_local_timeout, remote_timeout)
            .await
    }

    /// Send one request and wait for its response.
    ///
    /// A zero `local_timeout` waits indefinitely; a zero `remote_timeout`
    /// leaves the handler unbounded.
    ///
    /// # Returns
    ///
    /// - `NotSubscribersChannel` if nobody was listening on `C:sender`
    /// - `Success` with the decoded response
    /// - `Error` with the remote error descriptor
    ///
    /// # Errors
    ///
    /// `LocalTimeout` when the wait expires; `EmptyResponse` or a decode error
    /// when the response cannot be used; `Shutdown` after `shutdown()`;
    /// broker and encoding failures, including loss of the response subscription.
    pub async fn send_with_timeouts(
        &self,
        message: &P::Outgoing,
        local_timeout: Duration,
        remote_timeout: Duration,
    ) -> Result<RpcResponse<P::Message>, ChannelError> {
        let (correlation_id, waiter) = self.table.reserve();
        let _release = ReleaseGuard::new(&self.table, correlation_id);

        // Checked after reserving: a concurrent shutdown either aborts this
        // record or is observed here
        self.ensure_open()?;

        let mut envelope = Envelope::request(correlation_id, remote_timeout);
        self.payload.write_message(message, &mut envelope)?;
        let bytes = envelope.to_vec()?;

        let receivers = self.broker.publish(self.channels.sender(), &bytes).await?;
        if receivers == 0 {
            log_correlated_event!(
                warn,
                self.channels.logical(),
                "No subscribers on request channel",
                correlation_id
            );
            return Ok(RpcResponse::not_subscribers());
        }
        log_correlated_event!(
            debug,
            self.channels.logical(),
            "Request published",
            correlation_id,
            receivers,
            remote_timeout_ms = remote_timeout.as_millis() as u64
        );

        let settled = if local_timeout.is_zero() {
            waiter.await
        } else {
            match timeout(local_timeout, waiter).await {
                Ok(settled) => settled,
                Err(_) => {
                    warn!(
                        channel = %self.channels.logical(),
                        correlation_id = %correlation_id,
                        timeout_ms = local_timeout.as_millis() as u64,
                        "Local timeout waiting for response"
                    );
                    return Err(ChannelError::LocalTimeout {
                        timeout: local_timeout,
                    });
                }
            }
        };

        let completion = settled.map_err(|_| ChannelError::WaiterDropped)??;
        if let Completion::Error(error) = &completion {
            debug!(
                channel = %self.channels.logical(),
                correlation_id = %correlation_id,
                error = %error,
                "Remote error response"
            );
        }
        Ok(completion.into())
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.is_shutdown() {
            return Err(ChannelError::Shutdown);
        }
        if self.subscriber.state() == LoopState::Failed {
            let error = self.subscriber.failure().unwrap_or(BrokerError::Closed);
            return Err(ChannelError::Broker(error));
        }
        Ok(())
    }
}

/// Completes pending records from envelopes arriving on `C:receiver`.
struct ResponseListener<P: Payload> {
    channel: String,
    payload: Arc<P>,
    table: Arc<CorrelationTable<P::Message>>,
}

impl<P: Payload> MessageListener for ResponseListener<P> {
    fn on_message(&self, _channel: &str, bytes: &[u8]) {
        let envelope = match Envelope::from_slice(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                // A response whose id survives still settles its caller
                match salvage_correlation(bytes) {
                    Some(id) if self.table.is_pending(&id) => {
                        log_correlated_event!(
                            debug,
                            self.channel,
                            "Malformed response envelope",
                            id,
                            error = %e
                        );
                        self.table.complete(id, Err(e));
                    }
                    _ => debug!(
                        channel = %self.channel,
                        error = %e,
                        "Dropping malformed response envelope"
                    ),
                }
                return;
            }
        };

        let correlation_id = match envelope.correlation() {
            Ok(id) => id,
            Err(CorrelationError::Missing) => {
                debug!(channel = %self.channel, "Dropping response without correlation id");
                return;
            }
            Err(CorrelationError::Malformed(reason)) => {
                warn!(
                    channel = %self.channel,
                    reason = %reason,
                    "Dropping response with malformed correlation id"
                );
                return;
            }
        };

        if !self.table.is_pending(&correlation_id) {
            self.table.note_orphan(correlation_id);
            return;
        }

        let outcome = match envelope.error() {
            Some(error) => Ok(Completion::Error(error)),
            None => self.payload.read_response(&envelope).map(Completion::Success),
        };
        if let Err(e) = &outcome {
            log_correlated_event!(
                debug,
                self.channel,
                "Response could not be decoded",
                correlation_id,
                error = %e
            );
        }
        self.table.complete(correlation_id, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryBroker;
    use crate::domain::pending::MessageStatus;

    #[tokio::test]
    async fn test_no_subscribers_releases_record() {
        let broker = Arc::new(InMemoryBroker::new());
        let sender = RpcByteSender::new(broker, "rpc:nobody");
        sender.start().unwrap();
        sender.ready().await.unwrap();

        let response = sender.send(b"ping").await.unwrap();
        assert_eq!(response.status, MessageStatus::NotSubscribersChannel);
        assert!(response.response.is_none());
        assert!(response.error.is_none());
        assert_eq!(sender.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_after_shutdown_is_rejected() {
        let broker = Arc::new(InMemoryBroker::new());
        let sender = RpcByteSender::new(broker, "rpc:closed");
        sender.start().unwrap();
        sender.shutdown();
        sender.join().await;

        assert!(matches!(sender.send(b"ping").await, Err(ChannelError::Shutdown)));
    }

    #[tokio::test]
    async fn test_send_admitted_during_shutdown_fails_fast() {
        let broker = Arc::new(InMemoryBroker::new());
        let sender = RpcByteSender::new(broker, "rpc:racing");
        sender.start().unwrap();
        sender.ready().await.unwrap();

        // Interrupt observed, pending records not yet aborted
        sender.subscriber.shutdown();
        assert_eq!(sender.table.abort_pending(), 0);

        let sent = timeout(Duration::from_secs(1), sender.send(b"late")).await;
        assert!(matches!(sent, Ok(Err(ChannelError::Shutdown))));
        assert_eq!(sender.pending_count(), 0);
        assert_eq!(sender.stats().total_released.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_send_after_subscription_loss_is_rejected() {
        let broker = Arc::new(InMemoryBroker::new());
        let sender = RpcByteSender::new(broker.clone(), "rpc:lost");
        sender.start().unwrap();
        sender.ready().await.unwrap();

        broker.close();
        sender.join().await;
        assert!(!sender.is_shutdown());
        assert!(matches!(
            sender.send(b"ping").await,
            Err(ChannelError::Broker(BrokerError::Closed))
        ));
        assert_eq!(sender.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_timeout_is_written_on_request() {
        let broker = Arc::new(InMemoryBroker::new());
        let listener = Arc::new(Capture::default());
        let spy = SubscriberLoop::new("spy", broker.clone(), vec!["rpc:spy:sender".into()]);
        spy.start(listener.clone()).unwrap();
        spy.ready().await.unwrap();

        let sender = RpcByteSender::new(broker, "rpc:spy");
        let sent =
            sender.send_with_timeouts(b"x", Duration::from_millis(20), Duration::from_millis(700));
        assert!(matches!(sent.await, Err(ChannelError::LocalTimeout { .. })));
        assert_eq!(sender.pending_count(), 0);

        let captured = listener.last.lock().clone().expect("request seen");
        let envelope = Envelope::from_slice(&captured).unwrap();
        assert_eq!(envelope.remote_timeout, Some(700));
        assert!(envelope.correlation().is_ok());
    }

    #[derive(Default)]
    struct Capture {
        last: parking_lot::Mutex<Option<Vec<u8>>>,
    }

    impl MessageListener for Capture {
        fn on_message(&self, _channel: &str, payload: &[u8]) {
            *self.last.lock() = Some(payload.to_vec());
        }
    }
}
