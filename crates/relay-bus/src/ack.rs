//! Ack Handler - one-shot acknowledgements with a timeout sweep.
//!
//! Flow:
//! 1. Caller registers an id with `create_ack()` and awaits the returned future
//! 2. Some other party calls `trigger_ack()` with the same id
//! 3. The future resolves, or the sweep fails it once its deadline passes

use crate::config::AckConfig;
use crate::error::{AckError, AckResult};
use crate::metrics;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A registered ack waiting for its trigger
struct PendingEntry {
    /// Channel to resolve the waiter
    sender: oneshot::Sender<AckResult>,
    /// When the ack was registered
    created_at: Instant,
    /// When the sweep may fail it
    deadline: Instant,
}

/// Statistics for the ack handler
#[derive(Debug, Default)]
pub struct AckStats {
    /// Total acks registered
    pub total_registered: AtomicU64,
    /// Total acks resolved by a trigger
    pub total_triggered: AtomicU64,
    /// Total acks failed by the sweep
    pub total_timeouts: AtomicU64,
    /// Total acks replaced by a newer registration
    pub total_superseded: AtomicU64,
    /// Total acks cancelled by shutdown
    pub total_cancelled: AtomicU64,
}

/// Future returned by [`AckHandler::create_ack`].
#[derive(Debug)]
pub struct PendingAck {
    id: String,
    receiver: oneshot::Receiver<AckResult>,
}

impl PendingAck {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingAck {
    type Output = AckResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without resolving
            Poll::Ready(Err(_)) => Poll::Ready(Err(AckError::Cancelled {
                id: self.id.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Pending acks keyed by id.
///
/// Re-registering an id that is still pending fails the older future with
/// [`AckError::Superseded`].
pub struct AckHandler {
    pending: DashMap<String, PendingEntry>,
    config: AckConfig,
    stats: AckStats,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl AckHandler {
    /// Create a handler; starts the sweep when `complete_acks_on_timeout` is
    /// set and a Tokio runtime is available.
    pub fn new(config: AckConfig) -> Arc<Self> {
        let handler = Arc::new(Self {
            pending: DashMap::new(),
            config,
            stats: AckStats::default(),
            sweeper: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        if config.complete_acks_on_timeout {
            let period = config.ack_interval.max(Duration::from_millis(1));
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let task = runtime.spawn(sweep_task(Arc::downgrade(&handler), period));
                    *handler.sweeper.lock() = Some(task);
                }
                Err(_) => warn!("No Tokio runtime; ack timeout sweep not started"),
            }
        }

        handler
    }

    #[must_use]
    pub fn config(&self) -> &AckConfig {
        &self.config
    }

    /// Register an ack and get a future that resolves when it is triggered.
    pub fn create_ack(&self, id: impl Into<String>) -> PendingAck {
        let id = id.into();
        let (tx, rx) = oneshot::channel();

        if self.shut_down.load(Ordering::SeqCst) {
            let _ = tx.send(Err(AckError::Cancelled { id: id.clone() }));
            return PendingAck { id, receiver: rx };
        }

        self.register(&id, tx);
        PendingAck { id, receiver: rx }
    }

    /// Insert a pending entry for `id`.
    ///
    /// A shutdown that started after the caller's check may already have
    /// drained the map, so the flag is read again once the entry is visible.
    fn register(&self, id: &str, sender: oneshot::Sender<AckResult>) {
        let now = Instant::now();
        let entry = PendingEntry {
            sender,
            created_at: now,
            deadline: now + self.config.ack_threshold,
        };

        if let Some(previous) = self.pending.insert(id.to_string(), entry) {
            let _ = previous.sender.send(Err(AckError::Superseded {
                id: id.to_string(),
            }));
            self.stats.total_superseded.fetch_add(1, Ordering::Relaxed);
            debug!(ack_id = id, "Pending ack superseded");
        }

        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        metrics::record_ack_created();
        debug!(ack_id = id, "Registered pending ack");

        if self.shut_down.load(Ordering::SeqCst) {
            if let Some((id, entry)) = self.pending.remove(id) {
                let _ = entry.sender.send(Err(AckError::Cancelled { id }));
                self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
                debug!("Ack registered during shutdown cancelled");
            }
        }
    }

    /// Resolve a pending ack.
    ///
    /// Returns true if the id was pending, false if unknown or already
    /// resolved.
    pub fn trigger_ack(&self, id: &str) -> bool {
        let Some((_, entry)) = self.pending.remove(id) else {
            debug!(ack_id = id, "Trigger for unknown or resolved ack");
            return false;
        };

        self.stats.total_triggered.fetch_add(1, Ordering::Relaxed);
        let waited = entry.created_at.elapsed();
        if entry.sender.send(Ok(())).is_err() {
            debug!(ack_id = id, "Ack waiter already dropped");
        } else {
            debug!(ack_id = id, waited_ms = waited.as_millis(), "Ack triggered");
        }
        true
    }

    /// Fail every ack at or past its deadline.
    ///
    /// Returns the number of acks failed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let threshold_ms = u64::try_from(self.config.ack_threshold.as_millis()).unwrap_or(u64::MAX);
        let mut removed = 0;
        for id in expired {
            // Re-registered since the scan: leave the newer entry alone.
            let Some((id, entry)) = self.pending.remove_if(&id, |_, e| e.deadline <= now) else {
                continue;
            };
            warn!(
                ack_id = %id,
                elapsed_ms = now.duration_since(entry.created_at).as_millis(),
                threshold_ms = threshold_ms,
                "Ack timed out"
            );
            let _ = entry.sender.send(Err(AckError::TimedOut { id, threshold_ms }));
            removed += 1;
        }

        if removed > 0 {
            self.stats
                .total_timeouts
                .fetch_add(removed as u64, Ordering::Relaxed);
            metrics::record_acks_timed_out(removed);
        }
        removed
    }

    /// Get number of currently pending acks
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if an id is pending
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Get statistics
    pub fn stats(&self) -> &AckStats {
        &self.stats
    }

    /// Stop the sweep and fail every pending ack with `Cancelled`.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }

        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut cancelled = 0u64;
        for id in ids {
            if let Some((id, entry)) = self.pending.remove(&id) {
                let _ = entry.sender.send(Err(AckError::Cancelled { id }));
                cancelled += 1;
            }
        }
        self.stats
            .total_cancelled
            .fetch_add(cancelled, Ordering::Relaxed);
        debug!(cancelled = cancelled, "Ack handler shut down");
    }
}

impl Drop for AckHandler {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

/// Background task failing expired acks
async fn sweep_task(handler: Weak<AckHandler>, period: Duration) {
    let mut sweep_interval = tokio::time::interval(period);
    sweep_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        sweep_interval.tick().await;
        let Some(handler) = handler.upgrade() else {
            break;
        };
        let removed = handler.sweep_expired();
        if removed > 0 {
            debug!(removed = removed, "Swept expired acks");
        }
    }
}
