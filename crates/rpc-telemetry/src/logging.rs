//! Structured logging bootstrap.
//!
//! Logs carry consistent fields so they can be shipped and queried:
//! - `timestamp`: ISO 8601 timestamp
//! - `level`: Log level (trace, debug, info, warn, error)
//! - `target`: Module path that emitted the event
//! - `channel`: Logical RPC channel, when known
//! - `correlation_id`: Request/response correlation id, when known

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{TelemetryConfig, TelemetryError};

/// Structured logger handle
#[derive(Debug)]
pub struct StructuredLogger {
    service_name: String,
}

impl StructuredLogger {
    /// Service name the logger was installed for.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

/// Install the global tracing subscriber described by `config`.
///
/// Fails if a global subscriber is already installed or the filter directive
/// does not parse.
pub fn init_logging(config: &TelemetryConfig) -> Result<StructuredLogger, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::Filter(e.to_string()))?;

    let json_layer = (config.console_output && config.json_logs).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });

    let pretty_layer = (config.console_output && !config.json_logs).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(true)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        json_logs = config.json_logs,
        "Structured logging initialized"
    );

    Ok(StructuredLogger {
        service_name: config.service_name.clone(),
    })
}

/// Install a test-friendly subscriber that writes through the libtest capture.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Log an RPC event with the channel field always attached.
#[macro_export]
macro_rules! log_rpc_event {
    ($level:ident, $channel:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            channel = %$channel,
            $($($field)*,)?
            $msg
        )
    };
}

/// Log an event tied to a single request/response pair.
#[macro_export]
macro_rules! log_correlated_event {
    ($level:ident, $channel:expr, $msg:expr, $correlation_id:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            channel = %$channel,
            correlation_id = %$correlation_id,
            $($($field)*,)?
            $msg
        )
    };
}
