//! # Message Publisher
//!
//! Publishing side of the bus: topic registry, publish and fan-out,
//! scale-out ingest, subscribe and shutdown.
//!
//! Fan-out only flags subscriptions for work. Each subscription re-reads the
//! topic log on its own task, so a slow subscriber never blocks a publisher.

use crate::config::BusConfig;
use crate::domain::cursor::Cursor;
use crate::domain::message::ScaleoutMapping;
use crate::domain::scaleout_store::ScaleoutStore;
use crate::domain::topic_log::BoundedTopicLog;
use crate::error::{BusError, BusResult, ConfigError, StoreError};
use crate::metrics;
use crate::subscriber::{SubscribeOptions, Subscriber, SubscriptionHandle};
use crate::subscription::{DeliveryError, DeliveryWorker, MessageBatch, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Trait for publishing messages to the bus.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish a payload to a topic.
    ///
    /// # Returns
    ///
    /// The message's local id within the topic.
    async fn publish(&self, source: &str, key: &str, payload: Bytes) -> BusResult<u64>;

    /// Get the total number of messages published.
    fn messages_published(&self) -> u64;
}

/// A topic log and the subscriptions listening to it.
pub(crate) struct Topic {
    pub(crate) log: Arc<BoundedTopicLog>,
    subscribers: RwLock<HashMap<u64, Arc<dyn DeliveryWorker>>>,
}

impl Topic {
    fn new(key: &str, capacity: usize) -> Self {
        Self {
            log: Arc::new(BoundedTopicLog::new(key, capacity)),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Flag every listener for work. Returns how many were signalled.
    fn notify(&self) -> usize {
        let workers: Vec<_> = self.subscribers.read().values().cloned().collect();
        for worker in &workers {
            worker.clone().schedule();
        }
        workers.len()
    }
}

/// State shared between the bus and its subscriptions.
pub(crate) struct BusCore {
    config: BusConfig,
    topics: DashMap<String, Arc<Topic>>,
    scaleout: Option<ScaleoutStore>,
    /// Serializes scale-out ingest so per-topic order holds inside the
    /// global mapping order. Unused in single-process mode.
    ingest: Mutex<()>,
    subscriptions: DashMap<u64, Arc<dyn DeliveryWorker>>,
    next_subscription_id: AtomicU64,
    messages_published: AtomicU64,
    shut_down: AtomicBool,
}

impl BusCore {
    pub(crate) fn new(config: BusConfig) -> Self {
        let config = config.clamped();
        let scaleout = config
            .scaleout
            .map(|s| ScaleoutStore::new(s.fragment_size, s.fragment_count));
        Self {
            config,
            topics: DashMap::new(),
            scaleout,
            ingest: Mutex::new(()),
            subscriptions: DashMap::new(),
            next_subscription_id: AtomicU64::new(1),
            messages_published: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn scaleout(&self) -> Option<&ScaleoutStore> {
        self.scaleout.as_ref()
    }

    pub(crate) fn topic(&self, key: &str) -> Option<Arc<Topic>> {
        self.topics.get(key).map(|entry| entry.value().clone())
    }

    pub(crate) fn topic_or_create(&self, key: &str) -> Arc<Topic> {
        if let Some(topic) = self.topic(key) {
            return topic;
        }
        self.topics
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(topic = key, capacity = self.config.topic_capacity, "Topic created");
                Arc::new(Topic::new(key, self.config.topic_capacity))
            })
            .value()
            .clone()
    }

    fn ensure_running(&self) -> BusResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BusError::ShutDown);
        }
        Ok(())
    }

    fn publish(&self, source: &str, key: &str, payload: Bytes) -> BusResult<u64> {
        self.ensure_running()?;
        let topic = self.topic_or_create(key);

        let message = match &self.scaleout {
            None => topic.log.append(source, payload),
            Some(store) => {
                let _ingest = self.ingest.lock();
                let message = topic.log.append(source, payload);
                let mapping_id = store.add_next(vec![message.clone()]);
                debug!(topic = key, mapping_id, "Scale-out mapping assigned");
                message
            }
        };

        self.messages_published.fetch_add(1, Ordering::Relaxed);
        metrics::record_message_published();

        let notified = topic.notify();
        debug!(
            topic = key,
            source = source,
            local_id = message.local_id,
            notified = notified,
            "Message published"
        );
        Ok(message.local_id)
    }

    fn receive_scaleout(
        &self,
        mapping_id: u64,
        messages: Vec<(String, String, Bytes)>,
    ) -> BusResult<usize> {
        let store = self.scaleout.as_ref().ok_or(BusError::ScaleoutDisabled)?;
        self.ensure_running()?;

        let mut touched: BTreeMap<String, Arc<Topic>> = BTreeMap::new();
        let count = messages.len();
        {
            let _ingest = self.ingest.lock();
            if let Some(max) = store.max_mapping() {
                if mapping_id <= max.id {
                    warn!(
                        mapping_id = mapping_id,
                        max_mapping_id = max.id,
                        "Rejected non-monotonic scale-out mapping"
                    );
                    return Err(StoreError::NonMonotonicId {
                        id: mapping_id,
                        max: max.id,
                    }
                    .into());
                }
            }

            let mut appended = Vec::with_capacity(count);
            for (source, key, payload) in messages {
                let topic = touched
                    .entry(key)
                    .or_insert_with_key(|key| self.topic_or_create(key));
                appended.push(topic.log.append(&source, payload));
            }
            store.add(ScaleoutMapping::new(mapping_id, appended))?;
        }

        self.messages_published
            .fetch_add(count as u64, Ordering::Relaxed);
        for _ in 0..count {
            metrics::record_message_published();
        }

        let notified: usize = touched.values().map(|topic| topic.notify()).sum();
        debug!(
            mapping_id = mapping_id,
            messages = count,
            topics = touched.len(),
            notified = notified,
            "Scale-out mapping received"
        );
        Ok(count)
    }

    /// Turn a client cursor into a starting position for `keys`.
    fn resolve_cursor(&self, keys: &BTreeSet<String>, cursor: Option<&str>) -> BusResult<Cursor> {
        let parsed = cursor.map(str::parse::<Cursor>).transpose()?;

        match (&self.scaleout, parsed) {
            (Some(store), None) => Ok(Cursor::Scaleout(store.max_mapping().map(|m| m.id))),
            (Some(store), Some(Cursor::Scaleout(last))) => {
                let max = store.max_mapping().map(|m| m.id);
                match (last, max) {
                    (Some(id), max) if max.map_or(true, |max| id > max) => {
                        debug!(
                            cursor_id = id,
                            max_mapping_id = ?max,
                            "Scale-out cursor ahead of store, replaying"
                        );
                        Ok(Cursor::Scaleout(None))
                    }
                    _ => Ok(Cursor::Scaleout(last)),
                }
            }
            (Some(_), Some(Cursor::Topics(_))) => {
                Err(BusError::CursorModeMismatch { scaleout: true })
            }
            (None, Some(Cursor::Scaleout(_))) => {
                Err(BusError::CursorModeMismatch { scaleout: false })
            }
            (None, parsed) => {
                let mut offsets = BTreeMap::new();
                for key in keys {
                    let now = self.topic_or_create(key).log.next_id();
                    let offset = match parsed.as_ref().and_then(|c| c.offset(key)) {
                        Some(offset) if offset > now => {
                            debug!(
                                topic = %key,
                                offset,
                                next_id = now,
                                "Topic cursor ahead of log, replaying"
                            );
                            0
                        }
                        Some(offset) => offset,
                        None => now,
                    };
                    offsets.insert(key.clone(), offset);
                }
                Ok(Cursor::Topics(offsets))
            }
        }
    }

    fn register(&self, worker: Arc<dyn DeliveryWorker>, keys: &BTreeSet<String>) {
        let id = worker.id();
        self.subscriptions.insert(id, worker.clone());
        for key in keys {
            self.register_key(key, worker.clone());
        }
    }

    pub(crate) fn register_key(&self, key: &str, worker: Arc<dyn DeliveryWorker>) {
        let topic = self.topic_or_create(key);
        topic.subscribers.write().insert(worker.id(), worker);
    }

    pub(crate) fn unregister_key(&self, id: u64, key: &str) {
        if let Some(topic) = self.topic(key) {
            topic.subscribers.write().remove(&id);
        }
    }

    pub(crate) fn unregister<'a>(&self, id: u64, keys: impl IntoIterator<Item = &'a String>) {
        for key in keys {
            self.unregister_key(id, key);
        }
        self.subscriptions.remove(&id);
    }
}

/// In-memory message bus.
///
/// Owns every topic log and, in scale-out mode, the fragment store. Publish
/// and subscribe spawn delivery work on the ambient Tokio runtime.
pub struct InMemoryMessageBus {
    core: Arc<BusCore>,
}

impl InMemoryMessageBus {
    /// Create a bus; zero sizes in `config` are raised to 1.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            core: Arc::new(BusCore::new(config)),
        }
    }

    /// Create a bus with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BusConfig::default())
    }

    /// Create a bus after validating `config`.
    pub fn try_new(config: BusConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.core.config
    }

    #[must_use]
    pub fn is_scaleout(&self) -> bool {
        self.core.scaleout.is_some()
    }

    #[must_use]
    pub fn scaleout_store(&self) -> Option<&ScaleoutStore> {
        self.core.scaleout()
    }

    /// Topic log for `key`, if anything was published or subscribed to it.
    #[must_use]
    pub fn topic_log(&self, key: &str) -> Option<Arc<BoundedTopicLog>> {
        self.core.topic(key).map(|topic| topic.log.clone())
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.core.topics.len()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.core.subscriptions.len()
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.core.shut_down.load(Ordering::SeqCst)
    }

    /// Options carrying the configured default batch cap.
    #[must_use]
    pub fn default_options(&self) -> SubscribeOptions {
        SubscribeOptions::default().with_max_messages(self.core.config.default_max_messages)
    }

    /// Ingest one mapping ordered by an external authority.
    ///
    /// Appends each `(source, key, payload)` to its topic log, adds the
    /// mapping to the fragment store and notifies the affected topics.
    /// Returns the number of messages ingested.
    pub fn receive_scaleout(
        &self,
        mapping_id: u64,
        messages: Vec<(String, String, Bytes)>,
    ) -> BusResult<usize> {
        self.core.receive_scaleout(mapping_id, messages)
    }

    /// Subscribe with a batch cap and no subscribe-time notification.
    pub fn subscribe<S, F, Fut>(
        &self,
        subscriber: &dyn Subscriber,
        cursor: Option<&str>,
        callback: F,
        max_messages: usize,
        state: S,
    ) -> BusResult<SubscriptionHandle<S>>
    where
        S: Send + Sync + 'static,
        F: Fn(MessageBatch, Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, DeliveryError>> + Send + 'static,
    {
        let options = SubscribeOptions::default().with_max_messages(max_messages);
        self.subscribe_with_options(subscriber, cursor, callback, options, state)
    }

    /// Create and arm a subscription.
    ///
    /// A `None` cursor starts from "now"; anything else replays retained
    /// history first.
    pub fn subscribe_with_options<S, F, Fut>(
        &self,
        subscriber: &dyn Subscriber,
        cursor: Option<&str>,
        callback: F,
        options: SubscribeOptions,
        state: S,
    ) -> BusResult<SubscriptionHandle<S>>
    where
        S: Send + Sync + 'static,
        F: Fn(MessageBatch, Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, DeliveryError>> + Send + 'static,
    {
        self.core.ensure_running()?;
        if options.max_messages == 0 {
            return Err(BusError::InvalidMaxMessages);
        }

        let keys: BTreeSet<String> = subscriber.event_keys().into_iter().collect();
        let resolved = self.core.resolve_cursor(&keys, cursor)?;
        let id = self.core.next_subscription_id.fetch_add(1, Ordering::Relaxed);

        let subscription = Arc::new(Subscription::new(
            Arc::downgrade(&self.core),
            id,
            subscriber.identity(),
            keys.clone(),
            resolved,
            Arc::new(move |batch: MessageBatch, state: Arc<S>| callback(batch, state).boxed()),
            options.max_messages,
            options.notify_on_subscribe,
            Arc::new(state),
        ));
        self.core.register(subscription.clone(), &keys);

        if self.core.shut_down.load(Ordering::SeqCst) {
            DeliveryWorker::dispose(subscription);
            return Err(BusError::ShutDown);
        }

        debug!(
            subscription_id = id,
            identity = subscriber.identity(),
            topics = keys.len(),
            replay = cursor.is_some(),
            "Subscription created"
        );

        // Arm once so anything published between cursor resolution and
        // registration is picked up.
        DeliveryWorker::schedule(subscription.clone());
        Ok(SubscriptionHandle::new(subscription))
    }

    /// Stop accepting publishes and subscribes, and dispose every live
    /// subscription. Idempotent.
    pub fn shutdown(&self) {
        if self.core.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let workers: Vec<_> = self
            .core
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!(
            subscriptions = workers.len(),
            topics = self.core.topics.len(),
            "Message bus shutting down"
        );
        for worker in workers {
            worker.dispose();
        }
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Drop for InMemoryMessageBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl MessagePublisher for InMemoryMessageBus {
    async fn publish(&self, source: &str, key: &str, payload: Bytes) -> BusResult<u64> {
        self.core.publish(source, key, payload)
    }

    fn messages_published(&self) -> u64 {
        self.core.messages_published.load(Ordering::Relaxed)
    }
}
