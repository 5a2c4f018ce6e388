//! # RPC Receiver
//!
//! Subscribes to `C:sender`, runs the user handler for each request and
//! publishes exactly one response envelope per well-formed request on
//! `C:receiver`.
//!
//! The subscriber task only parses the envelope. Handler invocation, the
//! remote-timeout wait and the response publish all run on spawned tasks,
//! so a slow handler never blocks delivery of other requests.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use rpc_telemetry::log_correlated_event;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::domain::config::RpcConfig;
use crate::domain::correlation::CorrelationId;
use crate::domain::envelope::{salvage_correlation, ChannelPair, CorrelationError, Envelope};
use crate::domain::object::TypeRegistry;
use crate::error::ChannelError;
use crate::payload::{BytePayload, ObjectPayload, Payload};
use crate::ports::inbound::{LifecycleHooks, MessageListener, RpcHandler};
use crate::ports::outbound::{BrokerExecutions, ObjectCodec};
use crate::subscriber::SubscriberLoop;

/// Error message attached when a request carries no payload.
const EMPTY_MESSAGE: &str = "Empty message received";

/// Receiver of byte RPCs.
pub type RpcByteReceiver = RpcReceiver<BytePayload>;

/// Receiver of typed-object RPCs.
pub type RpcObjectReceiver = RpcReceiver<ObjectPayload>;

/// Server side of one logical RPC channel.
pub struct RpcReceiver<P: Payload> {
    channels: ChannelPair,
    broker: Arc<dyn BrokerExecutions>,
    payload: Arc<P>,
    handler: Arc<dyn RpcHandler<P::Message>>,
    config: RpcConfig,
    subscriber: SubscriberLoop,
}

impl RpcReceiver<BytePayload> {
    pub fn new(
        broker: Arc<dyn BrokerExecutions>,
        channel: impl Into<String>,
        handler: impl RpcHandler<Vec<u8>>,
    ) -> Self {
        Self::with_payload(broker, channel, BytePayload, handler)
    }
}

impl RpcReceiver<ObjectPayload> {
    pub fn new(
        broker: Arc<dyn BrokerExecutions>,
        channel: impl Into<String>,
        codec: Arc<dyn ObjectCodec>,
        handler: impl RpcHandler<<ObjectPayload as Payload>::Message>,
    ) -> Self {
        Self::with_payload(broker, channel, ObjectPayload::new(codec), handler)
    }

    pub fn from_registry(
        broker: Arc<dyn BrokerExecutions>,
        channel: impl Into<String>,
        registry: TypeRegistry,
        handler: impl RpcHandler<<ObjectPayload as Payload>::Message>,
    ) -> Self {
        Self::with_payload(broker, channel, ObjectPayload::from_registry(registry), handler)
    }
}

impl<P: Payload> RpcReceiver<P> {
    pub fn with_payload(
        broker: Arc<dyn BrokerExecutions>,
        channel: impl Into<String>,
        payload: P,
        handler: impl RpcHandler<P::Message>,
    ) -> Self {
        let channels = ChannelPair::new(channel);
        let config = RpcConfig::default();
        let subscriber = SubscriberLoop::new(
            format!("{}-receiver", channels.logical()),
            broker.clone(),
            vec![channels.sender().to_string()],
        )
        .with_shutdown_grace(config.shutdown_grace);

        Self {
            channels,
            broker,
            payload: Arc::new(payload),
            handler: Arc::new(handler),
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

    /// Start serving requests from `C:sender`.
    pub fn start(&self) -> Result<(), ChannelError> {
        let dispatcher = Arc::new(RequestDispatcher {
            channels: self.channels.clone(),
            broker: self.broker.clone(),
            payload: self.payload.clone(),
            handler: self.handler.clone(),
            abort_on_timeout: self.config.abort_handler_on_remote_timeout,
        });
        self.subscriber.start(dispatcher)?;
        info!(channel = %self.channels.logical(), "RPC receiver started");
        Ok(())
    }

    /// Resolves once the request subscription is confirmed by the broker.
    pub async fn ready(&self) -> Result<(), ChannelError> {
        self.subscriber.ready().await
    }

    /// Stop taking requests. Handlers already running still publish their responses.
    pub fn shutdown(&self) {
        self.subscriber.shutdown();
    }

    pub async fn join(&self) {
        self.subscriber.join().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.subscriber.is_shutdown()
    }
}

/// Turns request envelopes into handler invocations and response publishes.
struct RequestDispatcher<P: Payload> {
    channels: ChannelPair,
    broker: Arc<dyn BrokerExecutions>,
    payload: Arc<P>,
    handler: Arc<dyn RpcHandler<P::Message>>,
    abort_on_timeout: bool,
}

impl<P: Payload> MessageListener for RequestDispatcher<P> {
    fn on_message(&self, _channel: &str, bytes: &[u8]) {
        let request = match Envelope::from_slice(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Answer whenever the caller can still be identified
                match salvage_correlation(bytes) {
                    Some(correlation_id) => {
                        log_correlated_event!(
                            debug,
                            self.channels.logical(),
                            "Malformed request envelope",
                            correlation_id,
                            error = %e
                        );
                        let mut response = Envelope::response_to(correlation_id);
                        response.fail_with(&e);
                        self.spawn_publish(correlation_id, response);
                    }
                    None => debug!(
                        channel = %self.channels.logical(),
                        error = %e,
                        "Dropping malformed request envelope"
                    ),
                }
                return;
            }
        };

        let correlation_id = match request.correlation() {
            Ok(id) => id,
            Err(CorrelationError::Missing) => {
                debug!(
                    channel = %self.channels.logical(),
                    "Dropping request without correlation id"
                );
                return;
            }
            Err(CorrelationError::Malformed(reason)) => {
                warn!(
                    channel = %self.channels.logical(),
                    reason = %reason,
                    "Dropping request with malformed correlation id"
                );
                return;
            }
        };

        let mut response = Envelope::response_to(correlation_id);

        if request.message.is_none() {
            response.error_message = Some(EMPTY_MESSAGE.to_string());
            self.spawn_publish(correlation_id, response);
            return;
        }

        let message = match self.payload.read_message(&request) {
            Ok(message) => message,
            Err(e) => {
                log_correlated_event!(
                    debug,
                    self.channels.logical(),
                    "Request payload could not be decoded",
                    correlation_id,
                    error = %e
                );
                response.fail_with(&e);
                self.spawn_publish(correlation_id, response);
                return;
            }
        };

        let remote_timeout = request.remote_timeout();
        let handler = self.handler.clone();
        let payload = self.payload.clone();
        let broker = self.broker.clone();
        let channels = self.channels.clone();
        let abort_on_timeout = self.abort_on_timeout;

        tokio::spawn(async move {
            let written = invoke(handler, message, remote_timeout, abort_on_timeout)
                .await
                .and_then(|reply| payload.write_response(&reply, &mut response));
            if let Err(e) = written {
                log_correlated_event!(
                    debug,
                    channels.logical(),
                    "Request failed",
                    correlation_id,
                    error = %e
                );
                response.response = None;
                response.class_name = None;
                response.fail_with(&e);
            }
            publish_response(broker.as_ref(), &channels, correlation_id, &response).await;
        });
    }
}

impl<P: Payload> RequestDispatcher<P> {
    fn spawn_publish(&self, correlation_id: CorrelationId, response: Envelope) {
        let broker = self.broker.clone();
        let channels = self.channels.clone();
        tokio::spawn(async move {
            publish_response(broker.as_ref(), &channels, correlation_id, &response).await;
        });
    }
}

/// Run the handler on its own task, bounded by `remote_timeout` when non-zero.
async fn invoke<M: Send + 'static>(
    handler: Arc<dyn RpcHandler<M>>,
    message: M,
    remote_timeout: Duration,
    abort_on_timeout: bool,
) -> Result<M, ChannelError> {
    let mut task = tokio::spawn(async move { handler.receive(message).await });

    let joined = if remote_timeout.is_zero() {
        (&mut task).await
    } else {
        match tokio::time::timeout(remote_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                if abort_on_timeout {
                    task.abort();
                }
                return Err(ChannelError::RemoteTimeout {
                    timeout: remote_timeout,
                });
            }
        }
    };

    match joined {
        Ok(result) => result.map_err(ChannelError::from),
        Err(e) => Err(ChannelError::HandlerPanicked(join_error_message(e))),
    }
}

fn join_error_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let panic: Box<dyn Any + Send> = error.into_panic();
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

async fn publish_response(
    broker: &dyn BrokerExecutions,
    channels: &ChannelPair,
    correlation_id: CorrelationId,
    response: &Envelope,
) {
    let bytes = match response.to_vec() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(correlation_id = %correlation_id, error = %e, "Response could not be encoded");
            return;
        }
    };

    match broker.publish(channels.receiver(), &bytes).await {
        Ok(0) => debug!(
            channel = %channels.logical(),
            correlation_id = %correlation_id,
            "No sender listening for response"
        ),
        Ok(receivers) => debug!(
            channel = %channels.logical(),
            correlation_id = %correlation_id,
            receivers,
            "Response published"
        ),
        Err(e) => warn!(
            channel = %channels.logical(),
            correlation_id = %correlation_id,
            error = %e,
            "Response publish failed"
        ),
    }
}
