//! Inbound Ports (Driving Ports)
//!
//! Callbacks driven by the broker and by incoming requests: the raw
//! subscription listener, user RPC handlers, one-way consumers and
//! subscribe/unsubscribe hooks.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HandlerError;

/// Receives every message delivered on a subscription.
///
/// Called from the subscriber task; implementations must return quickly and
/// hand long-running work to another task.
pub trait MessageListener: Send + Sync + 'static {
    fn on_message(&self, channel: &str, payload: &[u8]);
}

/// User handler answering RPC requests.
///
/// Runs on its own task, never on the subscriber task, so it may take as
/// long as it likes (subject to the request's remote timeout).
#[async_trait]
pub trait RpcHandler<M: Send + 'static>: Send + Sync + 'static {
    async fn receive(&self, message: M) -> Result<M, HandlerError>;
}

#[async_trait]
impl<M, F, Fut> RpcHandler<M> for F
where
    M: Send + 'static,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<M, HandlerError>> + Send + 'static,
{
    async fn receive(&self, message: M) -> Result<M, HandlerError> {
        (self)(message).await
    }
}

/// User consumer for one-way messages. Called on the subscriber task.
pub trait MessageConsumer<M>: Send + Sync + 'static {
    fn receive(&self, message: M);
}

impl<M, F> MessageConsumer<M> for F
where
    F: Fn(M) + Send + Sync + 'static,
{
    fn receive(&self, message: M) {
        (self)(message)
    }
}

type ChannelHook = Arc<dyn Fn(&str, usize) + Send + Sync>;

/// Callbacks fired when the broker confirms a subscribe or unsubscribe.
///
/// Each hook receives the channel name and the current number of channels
/// the subscription holds.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    on_subscribe: Option<ChannelHook>,
    on_unsubscribe: Option<ChannelHook>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_subscribe(mut self, hook: impl Fn(&str, usize) + Send + Sync + 'static) -> Self {
        self.on_subscribe = Some(Arc::new(hook));
        self
    }

    pub fn on_unsubscribe(mut self, hook: impl Fn(&str, usize) + Send + Sync + 'static) -> Self {
        self.on_unsubscribe = Some(Arc::new(hook));
        self
    }

    pub(crate) fn subscribed(&self, channel: &str, subscribed_channels: usize) {
        if let Some(hook) = &self.on_subscribe {
            hook(channel, subscribed_channels);
        }
    }

    pub(crate) fn unsubscribed(&self, channel: &str, subscribed_channels: usize) {
        if let Some(hook) = &self.on_unsubscribe {
            hook(channel, subscribed_channels);
        }
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("on_subscribe", &self.on_subscribe.is_some())
            .field("on_unsubscribe", &self.on_unsubscribe.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_hooks_receive_channel_and_count() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let hooks = LifecycleHooks::new().on_subscribe(move |channel, count| {
            assert_eq!(channel, "rpc:bam:sender");
            counter.fetch_add(count, Ordering::SeqCst);
        });

        hooks.subscribed("rpc:bam:sender", 1);
        hooks.unsubscribed("rpc:bam:sender", 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = |message: Vec<u8>| async move {
            let mut reply = message;
            reply.reverse();
            Ok::<_, HandlerError>(reply)
        };
        let reply = RpcHandler::receive(&handler, vec![1, 2, 3]).await.unwrap();
        assert_eq!(reply, vec![3, 2, 1]);
    }
}
