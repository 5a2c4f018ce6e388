//! # RPC Telemetry
//!
//! Logging bootstrap shared by services built on `pubsub-rpc`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rpc_telemetry::{init_logging, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TelemetryConfig::from_env();
//!     let _logger = init_logging(&config).expect("Failed to init logging");
//!
//!     // Sender/receiver events are now emitted through `tracing`
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RPC_SERVICE_NAME` | `pubsub-rpc` | Service name in logs |
//! | `RPC_LOG_LEVEL` | `info` | Log level filter (falls back to `RUST_LOG`) |
//! | `RPC_CONSOLE_OUTPUT` | `true` | Write logs to stdout |
//! | `RPC_JSON_LOGS` | `false` | JSON log lines instead of pretty output |

mod config;
mod logging;

pub use config::TelemetryConfig;
pub use logging::{init_logging, init_test_logging, StructuredLogger};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    Filter(String),

    #[error("Global subscriber already installed: {0}")]
    AlreadyInitialized(String),
}
