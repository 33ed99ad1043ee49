//! # Relay Telemetry
//!
//! Logging bootstrap for processes embedding the relay bus.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_telemetry::{init_tracing, TelemetryConfig};
//!
//! fn main() {
//!     let config = TelemetryConfig::from_env();
//!     init_tracing(&config).expect("Failed to init tracing");
//!
//!     // relay-bus events are now emitted as structured logs
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RUST_LOG` | unset | Filter directives; wins over `RELAY_LOG_LEVEL` |
//! | `RELAY_LOG_LEVEL` | `info` | Filter directives |
//! | `RELAY_JSON_LOGS` | `false` (`true` in containers) | JSON output |
//! | `RELAY_CONSOLE_OUTPUT` | `true` | Console output |
//! | `RELAY_SERVICE_NAME` | `relay` | Service name |

mod config;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use tracing_setup::{env_filter, init_tracing};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    Filter(String),

    #[error("Failed to install tracing subscriber: {0}")]
    Init(String),
}
