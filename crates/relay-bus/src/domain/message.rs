//! # Messages and Scale-out Mappings
//!
//! A `Message` is immutable once published. The topic log that created it
//! owns it; batches and scale-out mappings hold `Arc` references.

use bytes::Bytes;
use std::sync::Arc;

/// A single published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Identity of the publisher (connection id, hub name, ...).
    pub source: String,

    /// Topic key the message was published to.
    pub key: String,

    /// Opaque payload.
    pub value: Bytes,

    /// Sequence number within the topic, strictly increasing.
    pub local_id: u64,
}

impl Message {
    /// Create a message.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        local_id: u64,
    ) -> Self {
        Self {
            source: source.into(),
            key: key.into(),
            value: value.into(),
            local_id,
        }
    }
}

/// "At global sequence `id`, these messages became visible."
///
/// Only used when several backend processes must agree on one ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleoutMapping {
    /// Global, monotonic sequence id.
    pub id: u64,

    /// Messages made visible at this id, in publish order.
    pub messages: Vec<Arc<Message>>,
}

impl ScaleoutMapping {
    #[must_use]
    pub fn new(id: u64, messages: Vec<Arc<Message>>) -> Self {
        Self { id, messages }
    }

    /// Convenience for tests and single-message publishes.
    #[must_use]
    pub fn single(id: u64, message: Arc<Message>) -> Self {
        Self {
            id,
            messages: vec![message],
        }
    }

    /// Iterate the messages whose topic key satisfies `wanted`.
    pub fn messages_for<'a, F>(&'a self, wanted: F) -> impl Iterator<Item = &'a Arc<Message>> + 'a
    where
        F: Fn(&str) -> bool + 'a,
    {
        self.messages.iter().filter(move |m| wanted(&m.key))
    }
}
