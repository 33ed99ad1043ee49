//! Error types for the message bus.
//!
//! Lookups that can legitimately miss (binary search, ack triggers) return
//! `Option`/`bool`; the enums here cover conditions a caller has to act on.

use thiserror::Error;

/// Errors surfaced by the bus API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus was shut down; no further publishes or subscribes are accepted.
    #[error("Message bus is shut down")]
    ShutDown,

    /// The supplied cursor could not be parsed.
    #[error("Invalid cursor: {0}")]
    InvalidCursor(#[from] CursorError),

    /// A per-topic cursor was handed to a scale-out bus, or the reverse.
    #[error("Cursor form does not match bus mode (scale-out: {scaleout})")]
    CursorModeMismatch { scaleout: bool },

    /// A scale-out operation was attempted on a bus without a fragment store.
    #[error("Scale-out mode is not enabled on this bus")]
    ScaleoutDisabled,

    /// A subscription asked for zero messages per batch.
    #[error("max_messages must be at least 1")]
    InvalidMaxMessages,

    /// The fragment store rejected a mapping.
    #[error("Scale-out store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the scale-out fragment store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Mapping ids must strictly increase.
    #[error("Mapping id {id} does not exceed current max {max}")]
    NonMonotonicId { id: u64, max: u64 },
}

/// Errors from cursor parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CursorError {
    /// The cursor string is not in a recognised form.
    #[error("Malformed cursor {cursor:?}: {reason}")]
    Malformed { cursor: String, reason: String },
}

impl CursorError {
    pub(crate) fn malformed(cursor: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            cursor: cursor.to_string(),
            reason: reason.into(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Ways a pending ack can fail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AckError {
    /// Not triggered before the deadline.
    #[error("Ack {id} timed out after {threshold_ms}ms")]
    TimedOut { id: String, threshold_ms: u64 },

    /// The same id was registered again while this one was pending.
    #[error("Ack {id} was superseded by a newer registration")]
    Superseded { id: String },

    /// The handler shut down, or the entry was dropped without a trigger.
    #[error("Ack {id} was cancelled")]
    Cancelled { id: String },
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Outcome of a pending ack.
pub type AckResult = Result<(), AckError>;
