//! # Bounded Topic Log
//!
//! Per-topic ring of the last `capacity` messages. Oldest entries are
//! overwritten silently; readers detect loss through `TopicRead::gap`.
//!
//! Each log has its own lock, so publishes to different topics never contend.

use super::message::Message;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

/// Result of reading a topic log from a cursor offset.
#[derive(Debug, Clone, Default)]
pub struct TopicRead {
    /// Messages in local-id order.
    pub messages: Vec<Arc<Message>>,

    /// Offset to store in the cursor after consuming `messages`.
    pub next: u64,

    /// True when the requested offset had already been evicted.
    pub gap: bool,
}

#[derive(Debug)]
struct LogRing {
    messages: VecDeque<Arc<Message>>,
    next_id: u64,
}

impl LogRing {
    fn first_id(&self) -> u64 {
        self.next_id - self.messages.len() as u64
    }
}

/// Fixed-capacity message log for one topic key.
#[derive(Debug)]
pub struct BoundedTopicLog {
    key: String,
    capacity: usize,
    ring: RwLock<LogRing>,
}

impl BoundedTopicLog {
    /// Create an empty log.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(key: impl Into<String>, capacity: usize) -> Self {
        assert!(capacity > 0, "topic log capacity must be at least 1");
        Self {
            key: key.into(),
            capacity,
            ring: RwLock::new(LogRing {
                messages: VecDeque::with_capacity(capacity),
                next_id: 0,
            }),
        }
    }

    /// Topic key this log belongs to.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of retained messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.read().messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.read().messages.is_empty()
    }

    /// Local id the next published message will receive ("now").
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.ring.read().next_id
    }

    /// Smallest local id still retained (equals `next_id` when empty).
    #[must_use]
    pub fn first_retained_id(&self) -> u64 {
        self.ring.read().first_id()
    }

    /// Append a message, evicting the oldest one when full.
    pub fn append(&self, source: &str, payload: Bytes) -> Arc<Message> {
        let mut ring = self.ring.write();
        let message = Arc::new(Message::new(source, self.key.as_str(), payload, ring.next_id));
        ring.next_id += 1;
        if ring.messages.len() == self.capacity {
            ring.messages.pop_front();
        }
        ring.messages.push_back(message.clone());
        message
    }

    /// Read up to `limit` messages starting at local id `from`.
    ///
    /// `from` past the end yields an empty read with `next == from`. `from`
    /// below the retained window starts at the oldest retained message and
    /// sets `gap`.
    #[must_use]
    pub fn read_from(&self, from: u64, limit: usize) -> TopicRead {
        let ring = self.ring.read();
        if from >= ring.next_id || limit == 0 {
            return TopicRead {
                messages: Vec::new(),
                next: from,
                gap: false,
            };
        }

        let first = ring.first_id();
        let (start, gap) = if from < first {
            (first, true)
        } else {
            (from, false)
        };

        let offset = (start - first) as usize;
        let messages: Vec<_> = ring
            .messages
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        let next = start + messages.len() as u64;

        TopicRead {
            messages,
            next,
            gap,
        }
    }
}
