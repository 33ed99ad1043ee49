//! # Bus Metrics
//!
//! Prometheus metrics for publish throughput, delivery health and ack
//! timeouts.
//!
//! ## Usage
//!
//! Enable with the `metrics` feature:
//! ```toml
//! relay-bus = { path = "...", features = ["metrics"] }
//! ```
//!
//! ## Metrics Exported
//!
//! - `relay_messages_published_total` - Messages appended to topic logs
//! - `relay_scaleout_mappings_total` - Mappings added to the fragment store
//! - `relay_scaleout_evictions_total` - Mappings evicted by ring rotation
//! - `relay_subscriptions_active` - Live subscriptions
//! - `relay_delivery_batches_total` - Batches handed to delivery callbacks
//! - `relay_delivery_failures_total` - Delivery callbacks that faulted
//! - `relay_acks_created_total` - Acks registered
//! - `relay_acks_timed_out_total` - Acks failed by the sweep

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};

#[cfg(feature = "metrics")]
lazy_static! {
    pub static ref MESSAGES_PUBLISHED: IntCounter = register_int_counter!(
        "relay_messages_published_total",
        "Total number of messages appended to topic logs"
    )
    .expect("Failed to create MESSAGES_PUBLISHED metric");

    pub static ref SCALEOUT_MAPPINGS: IntCounter = register_int_counter!(
        "relay_scaleout_mappings_total",
        "Total number of mappings added to the scale-out store"
    )
    .expect("Failed to create SCALEOUT_MAPPINGS metric");

    pub static ref SCALEOUT_EVICTIONS: IntCounter = register_int_counter!(
        "relay_scaleout_evictions_total",
        "Total number of mappings evicted from the scale-out store"
    )
    .expect("Failed to create SCALEOUT_EVICTIONS metric");

    pub static ref SUBSCRIPTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "relay_subscriptions_active",
        "Number of live subscriptions"
    )
    .expect("Failed to create SUBSCRIPTIONS_ACTIVE metric");

    pub static ref DELIVERY_BATCHES: IntCounter = register_int_counter!(
        "relay_delivery_batches_total",
        "Total number of batches handed to delivery callbacks"
    )
    .expect("Failed to create DELIVERY_BATCHES metric");

    pub static ref DELIVERY_FAILURES: IntCounter = register_int_counter!(
        "relay_delivery_failures_total",
        "Total number of delivery callbacks that faulted"
    )
    .expect("Failed to create DELIVERY_FAILURES metric");

    pub static ref ACKS_CREATED: IntCounter = register_int_counter!(
        "relay_acks_created_total",
        "Total number of acks registered"
    )
    .expect("Failed to create ACKS_CREATED metric");

    pub static ref ACKS_TIMED_OUT: IntCounter = register_int_counter!(
        "relay_acks_timed_out_total",
        "Total number of acks failed by the timeout sweep"
    )
    .expect("Failed to create ACKS_TIMED_OUT metric");
}

// =============================================================================
// METRIC RECORDING FUNCTIONS
// =============================================================================

#[cfg(feature = "metrics")]
pub fn record_message_published() {
    MESSAGES_PUBLISHED.inc();
}

#[cfg(feature = "metrics")]
pub fn record_scaleout_mapping(evicted: usize) {
    SCALEOUT_MAPPINGS.inc();
    SCALEOUT_EVICTIONS.inc_by(evicted as u64);
}

#[cfg(feature = "metrics")]
pub fn record_subscription_opened() {
    SUBSCRIPTIONS_ACTIVE.inc();
}

#[cfg(feature = "metrics")]
pub fn record_subscription_closed() {
    SUBSCRIPTIONS_ACTIVE.dec();
}

#[cfg(feature = "metrics")]
pub fn record_delivery_batch() {
    DELIVERY_BATCHES.inc();
}

#[cfg(feature = "metrics")]
pub fn record_delivery_failure() {
    DELIVERY_FAILURES.inc();
}

#[cfg(feature = "metrics")]
pub fn record_ack_created() {
    ACKS_CREATED.inc();
}

#[cfg(feature = "metrics")]
pub fn record_acks_timed_out(count: usize) {
    ACKS_TIMED_OUT.inc_by(count as u64);
}

// =============================================================================
// NO-OP IMPLEMENTATIONS (when metrics feature disabled)
// =============================================================================

#[cfg(not(feature = "metrics"))]
pub fn record_message_published() {}

#[cfg(not(feature = "metrics"))]
pub fn record_scaleout_mapping(_evicted: usize) {}

#[cfg(not(feature = "metrics"))]
pub fn record_subscription_opened() {}

#[cfg(not(feature = "metrics"))]
pub fn record_subscription_closed() {}

#[cfg(not(feature = "metrics"))]
pub fn record_delivery_batch() {}

#[cfg(not(feature = "metrics"))]
pub fn record_delivery_failure() {}

#[cfg(not(feature = "metrics"))]
pub fn record_ack_created() {}

#[cfg(not(feature = "metrics"))]
pub fn record_acks_timed_out(_count: usize) {}
