//! Domain layer: message storage and cursor positions.
//!
//! Everything here is synchronous and lock-scoped; no lock is held across an
//! `.await` anywhere in the crate.

pub mod cursor;
pub mod message;
pub mod scaleout_store;
pub mod topic_log;

pub use cursor::Cursor;
pub use message::{Message, ScaleoutMapping};
pub use scaleout_store::{Fragment, ScaleoutQueryResult, ScaleoutStore};
pub use topic_log::{BoundedTopicLog, TopicRead};
