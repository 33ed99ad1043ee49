//! Bus configuration with validation.
//!
//! Every field has a default; `from_env` overrides them from `RELAY_*`
//! variables and falls back to the default when a value does not parse.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default number of messages retained per topic.
pub const DEFAULT_TOPIC_CAPACITY: usize = 1000;

/// Default batch cap for subscriptions that do not pick one.
pub const DEFAULT_MAX_MESSAGES: usize = 100;

/// Main bus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Messages retained per topic log
    pub topic_capacity: usize,
    /// Batch cap handed out by `InMemoryMessageBus::default_options`
    pub default_max_messages: usize,
    /// Fragment store sizing; `None` runs the bus in single-process mode
    pub scaleout: Option<ScaleoutConfig>,
    /// Ack handler timing
    pub ack: AckConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            topic_capacity: DEFAULT_TOPIC_CAPACITY,
            default_max_messages: DEFAULT_MAX_MESSAGES,
            scaleout: None,
            ack: AckConfig::default(),
        }
    }
}

/// Scale-out fragment store sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleoutConfig {
    /// Mappings per fragment
    pub fragment_size: usize,
    /// Fragments in the ring
    pub fragment_count: usize,
}

impl Default for ScaleoutConfig {
    fn default() -> Self {
        Self {
            fragment_size: 64,
            fragment_count: 16,
        }
    }
}

impl ScaleoutConfig {
    #[must_use]
    pub fn new(fragment_size: usize, fragment_count: usize) -> Self {
        Self {
            fragment_size,
            fragment_count,
        }
    }

    /// Total mappings retained before eviction starts.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.fragment_size.saturating_mul(self.fragment_count)
    }
}

/// Ack handler timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AckConfig {
    /// How long an ack may stay pending
    pub ack_threshold: Duration,
    /// Sweep period
    pub ack_interval: Duration,
    /// Run the background sweep; disable to keep acks pending until triggered
    pub complete_acks_on_timeout: bool,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            ack_threshold: Duration::from_secs(30),
            ack_interval: Duration::from_secs(5),
            complete_acks_on_timeout: true,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

impl BusConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RELAY_TOPIC_CAPACITY`: Messages per topic (default: 1000)
    /// - `RELAY_MAX_MESSAGES`: Default batch cap (default: 100)
    /// - `RELAY_SCALEOUT_FRAGMENT_SIZE`: Mappings per fragment (default: 64)
    /// - `RELAY_SCALEOUT_FRAGMENT_COUNT`: Fragments in the ring (default: 16)
    /// - `RELAY_ACK_THRESHOLD_MS`: Ack deadline (default: 30000)
    /// - `RELAY_ACK_INTERVAL_MS`: Sweep period (default: 5000)
    /// - `RELAY_COMPLETE_ACKS_ON_TIMEOUT`: Run the sweep (default: true)
    ///
    /// Scale-out mode is enabled when either fragment variable is set.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let scaleout_defaults = ScaleoutConfig::default();
        let ack_defaults = AckConfig::default();

        let fragment_size = env_parse::<usize>("RELAY_SCALEOUT_FRAGMENT_SIZE");
        let fragment_count = env_parse::<usize>("RELAY_SCALEOUT_FRAGMENT_COUNT");
        let scaleout = (fragment_size.is_some() || fragment_count.is_some()).then(|| {
            ScaleoutConfig {
                fragment_size: fragment_size.unwrap_or(scaleout_defaults.fragment_size),
                fragment_count: fragment_count.unwrap_or(scaleout_defaults.fragment_count),
            }
        });

        Self {
            topic_capacity: env_parse("RELAY_TOPIC_CAPACITY").unwrap_or(defaults.topic_capacity),
            default_max_messages: env_parse("RELAY_MAX_MESSAGES")
                .unwrap_or(defaults.default_max_messages),
            scaleout,
            ack: AckConfig {
                ack_threshold: env_parse("RELAY_ACK_THRESHOLD_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(ack_defaults.ack_threshold),
                ack_interval: env_parse("RELAY_ACK_INTERVAL_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(ack_defaults.ack_interval),
                complete_acks_on_timeout: env_flag("RELAY_COMPLETE_ACKS_ON_TIMEOUT")
                    .unwrap_or(ack_defaults.complete_acks_on_timeout),
            },
        }
    }

    #[must_use]
    pub fn with_topic_capacity(mut self, capacity: usize) -> Self {
        self.topic_capacity = capacity;
        self
    }

    /// Enable scale-out mode with the given fragment store sizing.
    #[must_use]
    pub fn with_scaleout(mut self, fragment_size: usize, fragment_count: usize) -> Self {
        self.scaleout = Some(ScaleoutConfig::new(fragment_size, fragment_count));
        self
    }

    #[must_use]
    pub fn with_ack(mut self, ack: AckConfig) -> Self {
        self.ack = ack;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic_capacity == 0 {
            return Err(invalid("topic_capacity", "cannot be 0"));
        }

        if self.default_max_messages == 0 {
            return Err(invalid("default_max_messages", "cannot be 0"));
        }

        if let Some(scaleout) = &self.scaleout {
            if scaleout.fragment_size == 0 {
                return Err(invalid("scaleout.fragment_size", "cannot be 0"));
            }
            if scaleout.fragment_count == 0 {
                return Err(invalid("scaleout.fragment_count", "cannot be 0"));
            }
        }

        if self.ack.ack_threshold.is_zero() {
            return Err(invalid("ack.ack_threshold", "cannot be 0"));
        }

        if self.ack.complete_acks_on_timeout && self.ack.ack_interval.is_zero() {
            return Err(invalid("ack.ack_interval", "cannot be 0 while the sweep is enabled"));
        }

        Ok(())
    }

    /// Copy with every zero size raised to 1.
    pub(crate) fn clamped(&self) -> Self {
        let mut config = self.clone();
        config.topic_capacity = config.topic_capacity.max(1);
        config.default_max_messages = config.default_max_messages.max(1);
        if let Some(scaleout) = config.scaleout.as_mut() {
            scaleout.fragment_size = scaleout.fragment_size.max(1);
            scaleout.fragment_count = scaleout.fragment_count.max(1);
        }
        config
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
