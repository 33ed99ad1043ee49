//! # Subscription Delivery
//!
//! Per-subscriber delivery state machine.
//!
//! ```text
//!            schedule()/work()
//!   Idle ───────────────────────▶ Working ──┐ pass drained, nothing requeued
//!    ▲                              │  ▲     │
//!    └──────────────────────────────┘  └─────┘ requeued while in flight
//!                                   │
//!                                   ▼ stop / fault / dispose
//!                                Disposed
//! ```
//!
//! At most one pass runs at a time. A signal that arrives while a pass is in
//! flight only sets `requeued`; the running loop picks it up before going
//! back to `Idle`. No lock is held while the callback runs.

use crate::domain::cursor::{Cursor, CursorAdvance};
use crate::domain::message::Message;
use crate::metrics;
use crate::publisher::BusCore;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

const IDLE: u8 = 0;
const WORKING: u8 = 1;
const DISPOSED: u8 = 2;

/// A bounded batch handed to a delivery callback.
#[derive(Debug, Clone, Default)]
pub struct MessageBatch {
    /// Messages in delivery order; per-topic order is preserved.
    pub messages: Vec<Arc<Message>>,

    /// Serialized cursor positioned after this batch.
    pub cursor: String,

    /// Retention evicted messages between the previous cursor and this batch.
    pub gap: bool,

    /// Final batch delivered after an external dispose.
    pub terminal: bool,
}

impl MessageBatch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Failure reported through a subscription's completion.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// The delivery callback failed; carries its error unchanged.
    #[error("Delivery callback failed: {0}")]
    Callback(Arc<dyn std::error::Error + Send + Sync>),

    /// Delivery was cancelled before it could complete.
    #[error("Delivery cancelled")]
    Cancelled,

    /// The delivery callback panicked; carries the panic message.
    #[error("Delivery callback panicked: {0}")]
    Panicked(String),
}

impl DeliveryError {
    /// Wrap a callback's own error.
    pub fn callback<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(error))
    }
}

/// Boxed delivery callback. `Ok(false)` asks the bus to stop the subscription.
pub type DeliveryCallback<S> = Arc<
    dyn Fn(MessageBatch, Arc<S>) -> BoxFuture<'static, Result<bool, DeliveryError>> + Send + Sync,
>;

type DisposeHook = Box<dyn FnOnce() + Send>;

/// Bus-facing side of a subscription, independent of its state type.
pub(crate) trait DeliveryWorker: Send + Sync {
    fn id(&self) -> u64;

    /// Signal that new data may be available.
    fn schedule(self: Arc<Self>);

    /// Begin the external-dispose path.
    fn dispose(self: Arc<Self>);
}

enum PassOutcome {
    Idle,
    Finished(Result<(), DeliveryError>),
}

struct Collected {
    messages: Vec<Arc<Message>>,
    advance: CursorAdvance,
    gap: bool,
}

/// One subscriber's cursor, topic set and delivery loop.
pub struct Subscription<S> {
    id: u64,
    identity: String,
    core: Weak<BusCore>,
    keys: RwLock<BTreeSet<String>>,
    cursor: Mutex<Cursor>,
    max_messages: usize,
    callback: DeliveryCallback<S>,
    state: Arc<S>,
    flag: AtomicU8,
    requeued: AtomicBool,
    dispose_requested: AtomicBool,
    notify_pending: AtomicBool,
    /// Set when skipped mappings hid a gap from the next delivered batch.
    pending_gap: AtomicBool,
    rotation: AtomicUsize,
    completion: watch::Sender<Option<Result<(), DeliveryError>>>,
    hooks: Mutex<Vec<DisposeHook>>,
}

impl<S: Send + Sync + 'static> Subscription<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        core: Weak<BusCore>,
        id: u64,
        identity: &str,
        keys: BTreeSet<String>,
        cursor: Cursor,
        callback: DeliveryCallback<S>,
        max_messages: usize,
        notify_on_subscribe: bool,
        state: Arc<S>,
    ) -> Self {
        let (completion, _) = watch::channel(None);
        metrics::record_subscription_opened();
        Self {
            id,
            identity: identity.to_string(),
            core,
            keys: RwLock::new(keys),
            cursor: Mutex::new(cursor),
            max_messages: max_messages.max(1),
            callback,
            state,
            flag: AtomicU8::new(IDLE),
            requeued: AtomicBool::new(false),
            dispose_requested: AtomicBool::new(false),
            notify_pending: AtomicBool::new(notify_on_subscribe),
            pending_gap: AtomicBool::new(false),
            rotation: AtomicUsize::new(0),
            completion,
            hooks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Currently subscribed topic keys.
    #[must_use]
    pub fn event_keys(&self) -> Vec<String> {
        self.keys.read().iter().cloned().collect()
    }

    /// Current serialized cursor.
    #[must_use]
    pub fn cursor(&self) -> String {
        self.cursor.lock().to_string()
    }

    #[must_use]
    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.flag.load(Ordering::SeqCst) == DISPOSED
    }

    /// Subscribe to one more topic; observed from the next pass.
    ///
    /// Returns false if the key was already present or the subscription is
    /// disposed.
    pub(crate) fn add_event_key(self: &Arc<Self>, key: &str) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };

        {
            let mut keys = self.keys.write();
            // Dispose raises the flag before reading the key set.
            if self.dispose_requested.load(Ordering::SeqCst) || !keys.insert(key.to_string()) {
                return false;
            }
            if core.scaleout().is_none() {
                let now = core.topic_or_create(key).log.next_id();
                self.cursor.lock().track(key, now);
            }
            let worker: Arc<dyn DeliveryWorker> = self.clone();
            core.register_key(key, worker);
        }

        debug!(subscription_id = self.id, topic = key, "Topic added to subscription");
        self.clone().schedule();
        true
    }

    /// Stop listening to a topic; takes effect from the next pass.
    pub(crate) fn remove_event_key(self: &Arc<Self>, key: &str) -> bool {
        {
            let mut keys = self.keys.write();
            if !keys.remove(key) {
                return false;
            }
            self.cursor.lock().untrack(key);
            if let Some(core) = self.core.upgrade() {
                core.unregister_key(self.id, key);
            }
        }

        debug!(subscription_id = self.id, topic = key, "Topic removed from subscription");
        self.clone().schedule();
        true
    }

    /// Run a drain on the caller's task.
    ///
    /// Returns `Ok(())` immediately when a pass is already in flight; that
    /// pass will re-check for work before going idle. On a disposed
    /// subscription returns its final status.
    pub(crate) async fn work(self: &Arc<Self>) -> Result<(), DeliveryError> {
        if self.is_disposed() {
            return self.final_status();
        }

        self.requeued.store(true, Ordering::SeqCst);
        if !self.try_begin() {
            if self.is_disposed() {
                return self.final_status();
            }
            return Ok(());
        }
        self.clone().run().await
    }

    /// Resolves once the subscription reaches `Disposed`.
    pub(crate) async fn completion(&self) -> Result<(), DeliveryError> {
        let mut rx = self.completion.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(result) = current {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(DeliveryError::Cancelled);
            }
        }
    }

    /// Attach a cleanup hook; runs once on whichever path disposes the
    /// subscription, or immediately if it already has.
    pub(crate) fn on_disposed(&self, hook: DisposeHook) {
        let mut hooks = self.hooks.lock();
        if self.is_disposed() {
            drop(hooks);
            hook();
        } else {
            hooks.push(hook);
        }
    }

    fn final_status(&self) -> Result<(), DeliveryError> {
        self.completion.borrow().clone().unwrap_or(Ok(()))
    }

    fn try_begin(&self) -> bool {
        self.flag
            .compare_exchange(IDLE, WORKING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Owns the `Working` flag until it returns.
    async fn run(self: Arc<Self>) -> Result<(), DeliveryError> {
        loop {
            self.requeued.store(false, Ordering::SeqCst);

            if let PassOutcome::Finished(result) = self.drain().await {
                self.finish(result.clone());
                return result;
            }

            self.flag.store(IDLE, Ordering::SeqCst);
            if !self.requeued.load(Ordering::SeqCst) || !self.try_begin() {
                return Ok(());
            }
        }
    }

    async fn drain(&self) -> PassOutcome {
        loop {
            if self.dispose_requested.load(Ordering::SeqCst) {
                self.deliver_terminal().await;
                return PassOutcome::Finished(Ok(()));
            }

            let collected = self.collect();
            let notify = self.notify_pending.swap(false, Ordering::SeqCst);

            if collected.messages.is_empty() && !notify {
                if collected.advance.is_empty() {
                    return PassOutcome::Idle;
                }
                // Only mappings for other topics were consumed.
                if collected.gap {
                    self.pending_gap.store(true, Ordering::SeqCst);
                }
                self.cursor.lock().advance(&collected.advance);
                continue;
            }

            let batch = MessageBatch {
                cursor: self.projected_cursor(&collected.advance),
                messages: collected.messages,
                gap: collected.gap || self.pending_gap.load(Ordering::SeqCst),
                terminal: false,
            };
            let delivered = batch.messages.len();
            metrics::record_delivery_batch();

            match self.invoke(batch).await {
                Ok(true) => {
                    self.pending_gap.store(false, Ordering::SeqCst);
                    self.cursor.lock().advance(&collected.advance);
                    debug!(subscription_id = self.id, delivered, "Batch delivered");
                }
                Ok(false) => {
                    debug!(subscription_id = self.id, "Callback requested stop");
                    return PassOutcome::Finished(Ok(()));
                }
                Err(e) => {
                    metrics::record_delivery_failure();
                    debug!(subscription_id = self.id, error = %e, "Delivery callback failed");
                    return PassOutcome::Finished(Err(e));
                }
            }
        }
    }

    async fn deliver_terminal(&self) {
        let batch = MessageBatch {
            cursor: self.cursor(),
            terminal: true,
            ..MessageBatch::default()
        };
        if let Err(e) = self.invoke(batch).await {
            warn!(
                subscription_id = self.id,
                error = %e,
                "Terminal batch callback failed"
            );
        }
    }

    /// Run the callback, turning a panic into a delivery fault.
    async fn invoke(&self, batch: MessageBatch) -> Result<bool, DeliveryError> {
        let call = async { (self.callback)(batch, self.state.clone()).await };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(subscription_id = self.id, reason = %reason, "Delivery callback panicked");
                Err(DeliveryError::Panicked(reason))
            }
        }
    }

    fn projected_cursor(&self, advance: &CursorAdvance) -> String {
        let mut cursor = self.cursor.lock().clone();
        cursor.advance(advance);
        cursor.to_string()
    }

    fn collect(&self) -> Collected {
        let Some(core) = self.core.upgrade() else {
            return Collected {
                messages: Vec::new(),
                advance: CursorAdvance::Topics(Vec::new()),
                gap: false,
            };
        };
        let cursor = self.cursor.lock().clone();

        match cursor {
            Cursor::Scaleout(last) => self.collect_scaleout(&core, last),
            Cursor::Topics(_) => self.collect_topics(&core, &cursor),
        }
    }

    fn collect_topics(&self, core: &BusCore, cursor: &Cursor) -> Collected {
        let keys: Vec<String> = self.keys.read().iter().cloned().collect();
        let mut messages = Vec::new();
        let mut reached = Vec::new();
        let mut gap = false;

        if keys.is_empty() {
            return Collected {
                messages,
                advance: CursorAdvance::Topics(reached),
                gap,
            };
        }

        let start = self.rotation.fetch_add(1, Ordering::Relaxed) % keys.len();
        for key in keys.iter().cycle().skip(start).take(keys.len()) {
            let remaining = self.max_messages - messages.len();
            if remaining == 0 {
                break;
            }
            let Some(offset) = cursor.offset(key) else {
                continue;
            };
            let Some(topic) = core.topic(key) else {
                continue;
            };

            let read = topic.log.read_from(offset, remaining);
            if read.gap {
                debug!(
                    subscription_id = self.id,
                    topic = %key,
                    requested = offset,
                    "Topic cursor fell behind retention window"
                );
            }
            gap |= read.gap;
            if read.next != offset {
                reached.push((key.clone(), read.next));
            }
            messages.extend(read.messages);
        }

        Collected {
            messages,
            advance: CursorAdvance::Topics(reached),
            gap,
        }
    }

    fn collect_scaleout(&self, core: &BusCore, last: Option<u64>) -> Collected {
        let mut messages: Vec<Arc<Message>> = Vec::new();
        let mut reached = None;
        let Some(store) = core.scaleout() else {
            return Collected {
                messages,
                advance: CursorAdvance::Scaleout(reached),
                gap: false,
            };
        };

        let keys: HashSet<String> = self.keys.read().iter().cloned().collect();
        let result = store.get_messages_since(last, self.max_messages);
        if result.gap {
            debug!(
                subscription_id = self.id,
                requested = ?last,
                first_available = ?result.first_message_id,
                "Scale-out cursor fell behind retention window"
            );
        }

        for mapping in &result.mappings {
            let picked: Vec<_> = mapping
                .messages_for(|key| keys.contains(key))
                .cloned()
                .collect();
            if !messages.is_empty() && messages.len() + picked.len() > self.max_messages {
                break;
            }
            messages.extend(picked);
            reached = Some(mapping.id);
        }

        Collected {
            messages,
            advance: CursorAdvance::Scaleout(reached),
            gap: result.gap,
        }
    }

    fn finish(&self, result: Result<(), DeliveryError>) {
        self.dispose_requested.store(true, Ordering::SeqCst);
        if let Some(core) = self.core.upgrade() {
            let keys = self.keys.read();
            core.unregister(self.id, keys.iter());
        }

        let hooks = {
            let mut hooks = self.hooks.lock();
            self.flag.store(DISPOSED, Ordering::SeqCst);
            std::mem::take(&mut *hooks)
        };
        self.completion.send_replace(Some(result.clone()));
        metrics::record_subscription_closed();

        debug!(
            subscription_id = self.id,
            identity = %self.identity,
            failed = result.is_err(),
            "Subscription disposed"
        );

        for hook in hooks {
            hook();
        }
    }
}

impl<S: Send + Sync + 'static> DeliveryWorker for Subscription<S> {
    fn id(&self) -> u64 {
        self.id
    }

    fn schedule(self: Arc<Self>) {
        self.requeued.store(true, Ordering::SeqCst);
        if !self.try_begin() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = self.run().await;
                });
            }
            Err(_) => {
                if self.dispose_requested.load(Ordering::SeqCst) {
                    self.finish(Ok(()));
                } else {
                    debug!(subscription_id = self.id, "No runtime; delivery deferred");
                    self.flag.store(IDLE, Ordering::SeqCst);
                }
            }
        }
    }

    fn dispose(self: Arc<Self>) {
        if self.dispose_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            let keys = self.keys.read();
            core.unregister(self.id, keys.iter());
        }
        debug!(subscription_id = self.id, "Subscription dispose requested");
        self.schedule();
    }
}
