//! Sender/receiver configuration with validation.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::ConfigError;

/// Configuration shared by RPC senders and receivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Local wait bound applied by `send` when the caller gives none (zero = unbounded)
    #[serde(with = "humantime_serde")]
    pub default_local_timeout: Duration,
    /// Remote handler bound applied by `send` when the caller gives none (zero = unbounded)
    #[serde(with = "humantime_serde")]
    pub default_remote_timeout: Duration,
    /// How long the subscriber loop waits for the broker to release a subscription
    /// after `shutdown()` before abandoning it
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Abort the handler task when its remote timeout fires
    pub abort_handler_on_remote_timeout: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_local_timeout: Duration::ZERO,
            default_remote_timeout: Duration::ZERO,
            shutdown_grace: Duration::from_secs(5),
            abort_handler_on_remote_timeout: true,
        }
    }
}

impl RpcConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RPC_LOCAL_TIMEOUT_MS`: Default local timeout (default: 0, unbounded)
    /// - `RPC_REMOTE_TIMEOUT_MS`: Default remote timeout (default: 0, unbounded)
    /// - `RPC_SHUTDOWN_GRACE_MS`: Shutdown grace period (default: 5000)
    /// - `RPC_ABORT_ON_REMOTE_TIMEOUT`: Abort timed-out handlers (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_local_timeout: millis_from_env("RPC_LOCAL_TIMEOUT_MS")
                .unwrap_or(defaults.default_local_timeout),
            default_remote_timeout: millis_from_env("RPC_REMOTE_TIMEOUT_MS")
                .unwrap_or(defaults.default_remote_timeout),
            shutdown_grace: millis_from_env("RPC_SHUTDOWN_GRACE_MS")
                .unwrap_or(defaults.shutdown_grace),
            abort_handler_on_remote_timeout: env::var("RPC_ABORT_ON_REMOTE_TIMEOUT")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(defaults.abort_handler_on_remote_timeout),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shutdown_grace.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "shutdown_grace cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

fn millis_from_env(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}
