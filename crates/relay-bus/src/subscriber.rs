//! # Subscriber
//!
//! Subscribing side of the bus: who is listening, and the handle they get
//! back.

use crate::config::DEFAULT_MAX_MESSAGES;
use crate::subscription::{DeliveryError, DeliveryWorker, Subscription};
use std::sync::Arc;

/// Someone who listens to a set of topic keys.
///
/// Implemented by the transport layer's connection type; membership changes
/// after subscribe go through [`SubscriptionHandle::add_event_key`] and
/// [`SubscriptionHandle::remove_event_key`].
pub trait Subscriber: Send + Sync {
    /// Stable identity, used in logs.
    fn identity(&self) -> &str;

    /// Topic keys to listen to at subscribe time.
    fn event_keys(&self) -> Vec<String>;
}

/// A subscriber with a fixed identity and initial key set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicSubscriber {
    identity: String,
    event_keys: Vec<String>,
}

impl BasicSubscriber {
    pub fn new<I, K>(identity: impl Into<String>, event_keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            identity: identity.into(),
            event_keys: event_keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl Subscriber for BasicSubscriber {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn event_keys(&self) -> Vec<String> {
        self.event_keys.clone()
    }
}

/// Per-subscription delivery options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Upper bound on messages per batch.
    pub max_messages: usize,

    /// Deliver one batch at subscribe time, even if it is empty.
    pub notify_on_subscribe: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            notify_on_subscribe: false,
        }
    }
}

impl SubscribeOptions {
    #[must_use]
    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    #[must_use]
    pub fn notify_on_subscribe(mut self) -> Self {
        self.notify_on_subscribe = true;
        self
    }
}

/// Disposable handle to a live subscription.
///
/// When dropped, the subscription is disposed.
pub struct SubscriptionHandle<S: Send + Sync + 'static> {
    inner: Arc<Subscription<S>>,
}

impl<S: Send + Sync + 'static> SubscriptionHandle<S> {
    pub(crate) fn new(inner: Arc<Subscription<S>>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        self.inner.identity()
    }

    #[must_use]
    pub fn event_keys(&self) -> Vec<String> {
        self.inner.event_keys()
    }

    /// Serialized cursor to resume from after a reconnect.
    #[must_use]
    pub fn cursor(&self) -> String {
        self.inner.cursor()
    }

    /// Start listening to `key`, from "now".
    pub fn add_event_key(&self, key: &str) -> bool {
        self.inner.add_event_key(key)
    }

    pub fn remove_event_key(&self, key: &str) -> bool {
        self.inner.remove_event_key(key)
    }

    /// Run a drain pass on the calling task.
    ///
    /// # Errors
    ///
    /// Returns the callback's error if it faults during this drain, or the
    /// final status of an already finished subscription.
    pub async fn work(&self) -> Result<(), DeliveryError> {
        self.inner.work().await
    }

    /// Wait until the subscription is disposed.
    ///
    /// # Errors
    ///
    /// Returns the callback's error when delivery faulted.
    pub async fn completion(&self) -> Result<(), DeliveryError> {
        self.inner.completion().await
    }

    /// Attach a cleanup action run exactly once on disposal.
    pub fn on_disposed(&self, hook: impl FnOnce() + Send + 'static) {
        self.inner.on_disposed(Box::new(hook));
    }

    /// Unsubscribe. The callback receives one terminal batch once any
    /// in-flight pass settles.
    pub fn dispose(&self) {
        DeliveryWorker::dispose(self.inner.clone());
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}

impl<S: Send + Sync + 'static> Drop for SubscriptionHandle<S> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<S: Send + Sync + 'static> std::fmt::Debug for SubscriptionHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.inner.id())
            .field("identity", &self.inner.identity())
            .field("disposed", &self.inner.is_disposed())
            .finish()
    }
}
