//! # Relay Bus - In-Process Message Distribution Core
//!
//! Buffers recent messages per topic, lets subscribers resume from a cursor
//! and drives one bounded delivery loop per subscriber.
//!
//! ## Flow
//!
//! ```text
//! ┌──────────────┐  publish()   ┌──────────────────┐   schedule()   ┌──────────────┐
//! │  Publisher   │ ───────────▶ │ BoundedTopicLog  │ ─────────────▶ │ Subscription │
//! └──────────────┘              │ (+ScaleoutStore) │                │  drain loop  │
//!                               └──────────────────┘                └──────┬───────┘
//!                                        ▲        read since cursor        │
//!                                        └─────────────────────────────────┘
//!                                                                          │ callback(batch)
//!                                                                          ▼
//!                                                                    transport layer
//! ```
//!
//! ## Guarantees
//!
//! - **Bounded memory:** each topic keeps its last `topic_capacity` messages;
//!   the scale-out store keeps `fragment_size * fragment_count` mappings
//! - **Single-flight:** at most one delivery pass per subscription at a time
//! - **Ordering:** per-topic publish order; scale-out mode adds one global
//!   order through mapping ids
//! - **Gap signalling:** a cursor that fell behind retention yields
//!   `MessageBatch::gap`, never an error

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod ack;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod publisher;
pub mod subscriber;
pub mod subscription;

// Re-export main types
pub use ack::{AckHandler, AckStats, PendingAck};
pub use config::{AckConfig, BusConfig, ScaleoutConfig};
pub use domain::{
    BoundedTopicLog, Cursor, Fragment, Message, ScaleoutMapping, ScaleoutQueryResult,
    ScaleoutStore, TopicRead,
};
pub use error::{AckError, AckResult, BusError, BusResult, ConfigError, CursorError, StoreError};
pub use publisher::{InMemoryMessageBus, MessagePublisher};
pub use subscriber::{BasicSubscriber, SubscribeOptions, Subscriber, SubscriptionHandle};
pub use subscription::{DeliveryCallback, DeliveryError, MessageBatch};
