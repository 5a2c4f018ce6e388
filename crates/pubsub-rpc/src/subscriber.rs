//! # Subscriber Loop
//!
//! One dedicated task per logical subscription. The task owns the broker
//! `subscribe` future, so every `on_message` for that subscription is
//! dispatched from a single reader, in broker delivery order.
//!
//! ```text
//!  start() ──spawn──► [task] broker.subscribe(pubsub, channels)
//!                              │ on_subscribe(channel, n)   ─► hooks, ready()
//!                              │ on_message(channel, bytes) ─► listener
//!  shutdown() ─► pubsub.unsubscribe() ─► on_unsubscribe(channel, n) ─► return
//!             └► interrupt: abandon the subscription after the grace period
//!
//!  subscription ends without shutdown() ─► LoopState::Failed ─► on_failure callbacks
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{BrokerError, ChannelError};
use crate::ports::inbound::{LifecycleHooks, MessageListener};
use crate::ports::outbound::BrokerExecutions;

/// Lifecycle of a subscriber loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Not started yet
    Idle,
    /// Task spawned, waiting for the broker to confirm every channel
    Subscribing,
    /// Every channel confirmed
    Subscribed,
    /// Subscription released or abandoned after `shutdown()`
    Stopped,
    /// Subscription ended without a shutdown request
    Failed,
}

/// Subscription handle handed to the broker.
///
/// The broker drives `on_subscribe`, `on_message` and `on_unsubscribe`;
/// `unsubscribe()` asks the broker to release the subscription.
pub struct PubSub {
    name: String,
    listener: Arc<dyn MessageListener>,
    hooks: LifecycleHooks,
    expected_channels: usize,
    unsubscribe: watch::Sender<bool>,
    state: Arc<watch::Sender<LoopState>>,
}

impl PubSub {
    /// Standalone handle, for driving a broker directly.
    pub fn new(
        name: impl Into<String>,
        listener: Arc<dyn MessageListener>,
        hooks: LifecycleHooks,
        expected_channels: usize,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Subscribing);
        Self::with_state(name.into(), listener, hooks, expected_channels, Arc::new(state))
    }

    fn with_state(
        name: String,
        listener: Arc<dyn MessageListener>,
        hooks: LifecycleHooks,
        expected_channels: usize,
        state: Arc<watch::Sender<LoopState>>,
    ) -> Self {
        let (unsubscribe, _) = watch::channel(false);
        Self {
            name,
            listener,
            hooks,
            expected_channels,
            unsubscribe,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn on_message(&self, channel: &str, payload: &[u8]) {
        trace!(subscription = %self.name, channel, bytes = payload.len(), "Message received");
        self.listener.on_message(channel, payload);
    }

    pub fn on_subscribe(&self, channel: &str, subscribed_channels: usize) {
        debug!(
            subscription = %self.name,
            channel,
            subscribed_channels,
            "Subscribed"
        );
        if subscribed_channels >= self.expected_channels {
            self.state.send_if_modified(|state| {
                let confirm = *state == LoopState::Subscribing;
                if confirm {
                    *state = LoopState::Subscribed;
                }
                confirm
            });
        }
        self.hooks.subscribed(channel, subscribed_channels);
    }

    pub fn on_unsubscribe(&self, channel: &str, subscribed_channels: usize) {
        debug!(
            subscription = %self.name,
            channel,
            subscribed_channels,
            "Unsubscribed"
        );
        self.hooks.unsubscribed(channel, subscribed_channels);
    }

    /// Ask the broker to release this subscription.
    pub fn unsubscribe(&self) {
        self.unsubscribe.send_replace(true);
    }

    pub fn is_unsubscribed(&self) -> bool {
        *self.unsubscribe.borrow()
    }

    /// Resolves once `unsubscribe()` has been called.
    pub async fn unsubscribed(&self) {
        let mut rx = self.unsubscribe.subscribe();
        // The sender lives in `self`, so this only returns once the flag is set
        let _ = rx.wait_for(|flag| *flag).await;
    }
}

struct Running {
    pubsub: Arc<PubSub>,
    task: Option<JoinHandle<()>>,
}

/// Owns the task hosting one broker subscription.
pub struct SubscriberLoop {
    name: String,
    broker: Arc<dyn BrokerExecutions>,
    channels: Vec<String>,
    hooks: LifecycleHooks,
    shutdown_grace: Duration,
    state: Arc<watch::Sender<LoopState>>,
    failure: Arc<Mutex<Option<BrokerError>>>,
    interrupt: watch::Sender<bool>,
    running: Mutex<Option<Running>>,
}

impl SubscriberLoop {
    pub fn new(
        name: impl Into<String>,
        broker: Arc<dyn BrokerExecutions>,
        channels: Vec<String>,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        let (interrupt, _) = watch::channel(false);
        Self {
            name: name.into(),
            broker,
            channels,
            hooks: LifecycleHooks::default(),
            shutdown_grace: Duration::from_secs(5),
            state: Arc::new(state),
            failure: Arc::new(Mutex::new(None)),
            interrupt,
            running: Mutex::new(None),
        }
    }

    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.interrupt.borrow()
    }

    /// Why the subscription ended on its own, if it did.
    pub fn failure(&self) -> Option<BrokerError> {
        self.failure.lock().clone()
    }

    /// Run `callback` once if the subscription ends without a shutdown request.
    ///
    /// The callback runs on its own task after the state moved to `Failed`.
    pub fn on_failure(
        &self,
        callback: impl FnOnce(BrokerError) + Send + 'static,
    ) -> Result<(), ChannelError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ChannelError::Runtime(e.to_string()))?;
        let mut state = self.state.subscribe();
        let failure = self.failure.clone();

        runtime.spawn(async move {
            let ended = state
                .wait_for(|state| matches!(state, LoopState::Stopped | LoopState::Failed))
                .await
                .map(|state| *state);
            if let Ok(LoopState::Failed) = ended {
                let error = failure.lock().clone().unwrap_or(BrokerError::Closed);
                callback(error);
            }
        });
        Ok(())
    }

    /// Spawn the subscriber task on the current tokio runtime.
    pub fn start(&self, listener: Arc<dyn MessageListener>) -> Result<(), ChannelError> {
        if self.is_shutdown() {
            return Err(ChannelError::Shutdown);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ChannelError::Runtime(e.to_string()))?;

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ChannelError::AlreadyStarted);
        }

        let pubsub = Arc::new(PubSub::with_state(
            self.name.clone(),
            listener,
            self.hooks.clone(),
            self.channels.len(),
            self.state.clone(),
        ));
        self.state.send_replace(LoopState::Subscribing);

        let task = runtime.spawn(run_subscription(
            self.name.clone(),
            self.broker.clone(),
            pubsub.clone(),
            self.channels.clone(),
            self.interrupt.subscribe(),
            self.shutdown_grace,
            self.state.clone(),
            self.failure.clone(),
        ));

        *running = Some(Running {
            pubsub,
            task: Some(task),
        });
        Ok(())
    }

    /// Resolves once the broker confirmed every channel.
    pub async fn ready(&self) -> Result<(), ChannelError> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|state| *state != LoopState::Subscribing)
            .await
            .map_err(|_| ChannelError::Shutdown)?;
        match state {
            LoopState::Subscribed => Ok(()),
            LoopState::Idle => Err(ChannelError::NotStarted),
            LoopState::Failed => Err(ChannelError::Broker(
                self.failure().unwrap_or(BrokerError::Closed),
            )),
            LoopState::Subscribing | LoopState::Stopped => Err(ChannelError::Shutdown),
        }
    }

    /// Unsubscribe and interrupt the loop. Does not wait for the task to exit.
    pub fn shutdown(&self) {
        if self.interrupt.send_replace(true) {
            return;
        }
        match self.running.lock().as_ref() {
            Some(running) => running.pubsub.unsubscribe(),
            None => {
                self.state.send_replace(LoopState::Stopped);
            }
        }
        info!(subscription = %self.name, "Subscriber loop shutdown requested");
    }

    /// Wait for the subscriber task to exit.
    pub async fn join(&self) {
        let task = self
            .running
            .lock()
            .as_mut()
            .and_then(|running| running.task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(subscription = %self.name, error = %e, "Subscriber task ended abnormally");
            }
        }
    }
}

impl Drop for SubscriberLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_subscription(
    name: String,
    broker: Arc<dyn BrokerExecutions>,
    pubsub: Arc<PubSub>,
    channels: Vec<String>,
    mut interrupt: watch::Receiver<bool>,
    shutdown_grace: Duration,
    state: Arc<watch::Sender<LoopState>>,
    failure: Arc<Mutex<Option<BrokerError>>>,
) {
    info!(subscription = %name, channels = ?channels, "Subscriber loop started");

    let shutdown_requested = interrupt.clone();
    let abandon = async move {
        // An error means the loop owner is gone; treat it as an interrupt
        let _ = interrupt.wait_for(|flag| *flag).await;
        tokio::time::sleep(shutdown_grace).await;
    };

    let result = tokio::select! {
        biased;
        result = broker.subscribe(pubsub.clone(), &channels) => result,
        _ = abandon => {
            warn!(
                subscription = %name,
                grace_ms = shutdown_grace.as_millis() as u64,
                "Broker did not release subscription in time, abandoning"
            );
            Ok(())
        }
    };

    let requested = *shutdown_requested.borrow();
    let outcome = match result {
        Ok(()) if requested => {
            debug!(subscription = %name, "Subscription released");
            LoopState::Stopped
        }
        Ok(()) => {
            warn!(subscription = %name, "Broker released subscription without a shutdown request");
            *failure.lock() = Some(BrokerError::Closed);
            LoopState::Failed
        }
        Err(e) => {
            error!(subscription = %name, error = %e, "Subscription failed");
            *failure.lock() = Some(e);
            LoopState::Failed
        }
    };

    // The failure is recorded before the state flips so watchers always see it
    state.send_replace(outcome);
    info!(subscription = %name, state = ?outcome, "Subscriber loop stopped");
}
