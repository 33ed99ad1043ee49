//! # Telemetry Flow
//!
//! The global subscriber can be installed once per process; bus activity
//! afterwards logs through it.

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use relay_bus::{InMemoryMessageBus, MessagePublisher};
    use relay_telemetry::{init_tracing, TelemetryConfig, TelemetryError};

    // Only test in this binary that touches the global subscriber.
    #[tokio::test]
    async fn test_init_tracing_once_per_process() {
        let config = TelemetryConfig {
            log_level: "relay_bus=debug".to_string(),
            console_output: false,
            ..TelemetryConfig::default()
        };

        init_tracing(&config).unwrap();
        assert!(matches!(init_tracing(&config), Err(TelemetryError::Init(_))));

        let bus = InMemoryMessageBus::with_defaults();
        bus.publish("hub", "chat", Bytes::from_static(b"logged")).await.unwrap();
        bus.shutdown();
    }

    #[test]
    fn test_bad_filter_fails_before_install() {
        let config = TelemetryConfig {
            log_level: "relay_bus=loud".to_string(),
            ..TelemetryConfig::default()
        };
        assert!(matches!(init_tracing(&config), Err(TelemetryError::Filter(_))));
    }
}
