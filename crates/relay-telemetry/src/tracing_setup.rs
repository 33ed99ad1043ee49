//! Global tracing subscriber setup.
//!
//! One registry with an env filter and, when console output is on, either a
//! JSON layer (containers) or a human-readable layer (development).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{TelemetryConfig, TelemetryError};

/// Parse filter directives such as `info` or `relay_bus=debug,warn`.
pub fn env_filter(directives: &str) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(directives).map_err(|e| TelemetryError::Filter(e.to_string()))
}

/// Install the global subscriber.
///
/// Fails if the filter does not parse or a global subscriber is already set.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = env_filter(&config.log_level)?;

    match (config.console_output, config.json_logs) {
        (true, true) => {
            // JSON output for containers/production
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(json_layer)
                .try_init()
                .map_err(|e| TelemetryError::Init(e.to_string()))?;
        }
        (true, false) => {
            // Pretty output for development
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|e| TelemetryError::Init(e.to_string()))?;
        }
        (false, _) => {
            tracing_subscriber::registry()
                .with(filter)
                .try_init()
                .map_err(|e| TelemetryError::Init(e.to_string()))?;
        }
    }

    tracing::info!(
        service = %config.service_name,
        filter = %config.log_level,
        json = config.json_logs,
        "Tracing initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_directives() {
        assert!(env_filter("info").is_ok());
        assert!(env_filter("relay_bus=debug,warn").is_ok());
    }

    #[test]
    fn test_invalid_directive_rejected() {
        let result = env_filter("relay_bus=loud");
        assert!(matches!(result, Err(TelemetryError::Filter(_))));
    }

    // Installing the global subscriber is covered by the relay-tests crate,
    // which owns the process-wide default.
}
