//! # Scale-out Fragment Store
//!
//! Ring buffer of `fragment_count` fragments, each an ascending run of at most
//! `fragment_size` mappings. Resolving a cursor is a two-level binary search:
//! first over fragments in logical (oldest → newest) order, then inside the
//! chosen fragment. Cost is O(log F + log S) per reconnect.
//!
//! ## Ring layout
//!
//! ```text
//!  ring index:   0        1        2        3
//!             ┌────────┬────────┬────────┬────────┐
//!             │ 40..44 │ 45..49 │ 30..34 │ 35..39 │
//!             └────────┴────────┴────────┴────────┘
//!                          ▲ head   ▲ oldest (logical 0)
//! ```
//!
//! Once the ring has wrapped, the logical start is the slot after `head`.
//! Rotating into a slot clears it, so the slot being overwritten always holds
//! the newest ids and never breaks the ascending logical order.
//!
//! ## Concurrency
//!
//! Appends take the write lock once per mapping. Queries only take the read
//! lock, so many reconnecting clients resolve cursors in parallel.

use super::message::{Message, ScaleoutMapping};
use crate::error::StoreError;
use crate::metrics;
use parking_lot::RwLock;
use std::sync::Arc;

/// Snapshot of one fragment.
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    sequence: u64,
    mappings: Vec<Arc<ScaleoutMapping>>,
}

impl Fragment {
    /// Monotonic fragment number (how many rotations preceded it).
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn mappings(&self) -> &[Arc<ScaleoutMapping>] {
        &self.mappings
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    #[must_use]
    pub fn first_id(&self) -> Option<u64> {
        self.mappings.first().map(|m| m.id)
    }

    #[must_use]
    pub fn last_id(&self) -> Option<u64> {
        self.mappings.last().map(|m| m.id)
    }

    /// Binary search for `id`: `Ok(index)` on exact match, otherwise the
    /// insertion point of the nearest larger id.
    pub fn search(&self, id: u64) -> Result<usize, usize> {
        self.mappings.binary_search_by_key(&id, |m| m.id)
    }
}

/// Result of a cursor query.
#[derive(Debug, Clone, Default)]
pub struct ScaleoutQueryResult {
    /// Id of the first mapping returned; `None` when nothing was returned.
    ///
    /// When `gap` is set this equals the store's `min_mapping_id`, not the
    /// requested cursor.
    pub first_message_id: Option<u64>,

    /// Mappings after the cursor, ascending.
    pub mappings: Vec<Arc<ScaleoutMapping>>,

    /// True only when the result was truncated by the caller's cap.
    pub has_more_data: bool,

    /// Mappings after the cursor were evicted before it could read them.
    pub gap: bool,
}

impl ScaleoutQueryResult {
    fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Messages of every returned mapping, flattened in order.
    #[must_use]
    pub fn messages(&self) -> Vec<Arc<Message>> {
        self.mappings
            .iter()
            .flat_map(|m| m.messages.iter().cloned())
            .collect()
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.mappings.iter().map(|m| m.messages.len()).sum()
    }

    /// Id to resume from after consuming this result.
    #[must_use]
    pub fn last_mapping_id(&self) -> Option<u64> {
        self.mappings.last().map(|m| m.id)
    }
}

#[derive(Debug)]
struct FragmentRing {
    fragments: Vec<Fragment>,
    fragment_size: usize,
    /// Ring index of the fragment currently written.
    head: usize,
    /// Fragments holding data, at most `fragments.len()`.
    used: usize,
    next_sequence: u64,
    evicted: u64,
    /// Largest id ever evicted.
    last_evicted_id: Option<u64>,
}

impl FragmentRing {
    fn oldest(&self) -> usize {
        if self.used < self.fragments.len() {
            0
        } else {
            (self.head + 1) % self.fragments.len()
        }
    }

    fn logical(&self, index: usize) -> &Fragment {
        &self.fragments[(self.oldest() + index) % self.fragments.len()]
    }

    fn min_id(&self) -> Option<u64> {
        if self.used == 0 {
            return None;
        }
        self.logical(0).first_id()
    }

    fn max(&self) -> Option<&Arc<ScaleoutMapping>> {
        if self.used == 0 {
            return None;
        }
        self.fragments[self.head].mappings.last()
    }

    fn len(&self) -> usize {
        (0..self.used).map(|i| self.logical(i).len()).sum()
    }

    /// Logical index of the first fragment whose last id satisfies `!before(last)`.
    fn partition_fragments(&self, before: impl Fn(u64) -> bool) -> usize {
        let (mut lo, mut hi) = (0, self.used);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let last = self.logical(mid).last_id().unwrap_or(u64::MAX);
            if before(last) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Fragment that holds `id` or, for sparse ids, the nearest larger one.
    fn locate(&self, id: u64) -> Option<&Fragment> {
        let min = self.min_id()?;
        let max = self.max()?.id;
        if id < min || id > max {
            return None;
        }
        let index = self.partition_fragments(|last| last < id);
        (index < self.used).then(|| self.logical(index))
    }

    /// Logical (fragment, offset) of the first mapping with id > `cursor`.
    fn position_after(&self, cursor: u64) -> Option<(usize, usize)> {
        let fragment = self.partition_fragments(|last| last <= cursor);
        if fragment == self.used {
            return None;
        }
        let offset = self
            .logical(fragment)
            .mappings
            .partition_point(|m| m.id <= cursor);
        Some((fragment, offset))
    }

    fn collect_from(
        &self,
        start: (usize, usize),
        limit: usize,
    ) -> (Vec<Arc<ScaleoutMapping>>, bool) {
        let mut out = Vec::new();
        let (first_fragment, mut offset) = start;
        for index in first_fragment..self.used {
            let fragment = self.logical(index);
            for mapping in &fragment.mappings[offset..] {
                if out.len() == limit {
                    return (out, true);
                }
                out.push(mapping.clone());
            }
            offset = 0;
        }
        (out, false)
    }

    /// Append, rotating (and evicting) when the head fragment is full.
    /// Returns the number of mappings evicted.
    fn push(&mut self, mapping: Arc<ScaleoutMapping>) -> usize {
        let mut evicted = 0;
        if self.used == 0 {
            self.used = 1;
            self.head = 0;
            self.fragments[0].sequence = self.next_sequence;
            self.next_sequence += 1;
        } else if self.fragments[self.head].mappings.len() == self.fragment_size {
            self.head = (self.head + 1) % self.fragments.len();
            if self.used < self.fragments.len() {
                self.used += 1;
            } else {
                let victim = &self.fragments[self.head];
                evicted = victim.mappings.len();
                if let Some(last) = victim.last_id() {
                    self.last_evicted_id = Some(last);
                }
            }
            let fragment = &mut self.fragments[self.head];
            fragment.mappings.clear();
            fragment.sequence = self.next_sequence;
            self.next_sequence += 1;
            self.evicted += evicted as u64;
        }
        self.fragments[self.head].mappings.push(mapping);
        evicted
    }
}

/// Fragmented ring buffer giving one global ordering across processes.
#[derive(Debug)]
pub struct ScaleoutStore {
    fragment_size: usize,
    fragment_count: usize,
    ring: RwLock<FragmentRing>,
}

impl ScaleoutStore {
    /// Create an empty store holding at most `fragment_size * fragment_count`
    /// mappings.
    ///
    /// # Panics
    ///
    /// Panics if either dimension is zero.
    #[must_use]
    pub fn new(fragment_size: usize, fragment_count: usize) -> Self {
        assert!(fragment_size > 0, "fragment size must be at least 1");
        assert!(fragment_count > 0, "fragment count must be at least 1");

        let fragments = (0..fragment_count)
            .map(|_| Fragment {
                sequence: 0,
                mappings: Vec::with_capacity(fragment_size),
            })
            .collect();

        Self {
            fragment_size,
            fragment_count,
            ring: RwLock::new(FragmentRing {
                fragments,
                fragment_size,
                head: 0,
                used: 0,
                next_sequence: 0,
                evicted: 0,
                last_evicted_id: None,
            }),
        }
    }

    #[must_use]
    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragment_count
    }

    /// Maximum number of retained mappings.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.fragment_size * self.fragment_count
    }

    /// Number of retained mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.read().used == 0
    }

    /// Total mappings evicted since creation.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.ring.read().evicted
    }

    /// Smallest mapping id still retained.
    #[must_use]
    pub fn min_mapping_id(&self) -> Option<u64> {
        self.ring.read().min_id()
    }

    /// Most recently added mapping.
    #[must_use]
    pub fn max_mapping(&self) -> Option<Arc<ScaleoutMapping>> {
        self.ring.read().max().cloned()
    }

    /// Append a mapping whose id was assigned elsewhere.
    ///
    /// # Errors
    ///
    /// `StoreError::NonMonotonicId` if `mapping.id` does not exceed the
    /// current max.
    pub fn add(&self, mapping: ScaleoutMapping) -> Result<(), StoreError> {
        let mut ring = self.ring.write();
        if let Some(max) = ring.max() {
            if mapping.id <= max.id {
                return Err(StoreError::NonMonotonicId {
                    id: mapping.id,
                    max: max.id,
                });
            }
        }
        let evicted = ring.push(Arc::new(mapping));
        metrics::record_scaleout_mapping(evicted);
        Ok(())
    }

    /// Append `messages` under the next free id (max + 1, or 0 when empty).
    pub(crate) fn add_next(&self, messages: Vec<Arc<Message>>) -> u64 {
        let mut ring = self.ring.write();
        let id = ring.max().map_or(0, |m| m.id.saturating_add(1));
        let evicted = ring.push(Arc::new(ScaleoutMapping::new(id, messages)));
        metrics::record_scaleout_mapping(evicted);
        id
    }

    /// Find the fragment holding `id`.
    ///
    /// `None` when `id` is below `min_mapping_id` (evicted) or above the max
    /// mapping (not yet arrived). For sparse ids inside the retained range the
    /// fragment containing the nearest larger id is returned.
    #[must_use]
    pub fn try_get_fragment_from_mapping_id(&self, id: u64) -> Option<Fragment> {
        self.ring.read().locate(id).cloned()
    }

    /// Every mapping after `cursor` up to the max, uncapped.
    ///
    /// - `cursor >= max`: empty.
    /// - `cursor < min_mapping_id`: everything retained and
    ///   `first_message_id == min_mapping_id`. `gap` is set when an evicted
    ///   mapping lies after `cursor`.
    /// - otherwise: mappings strictly after `cursor`.
    #[must_use]
    pub fn get_messages_by_mapping_id(&self, cursor: u64) -> ScaleoutQueryResult {
        self.get_messages_since(Some(cursor), usize::MAX)
    }

    /// Capped query. `None` means nothing consumed yet: everything retained,
    /// without a gap.
    #[must_use]
    pub fn get_messages_since(
        &self,
        cursor: Option<u64>,
        max_mappings: usize,
    ) -> ScaleoutQueryResult {
        let ring = self.ring.read();
        let (Some(min), Some(max)) = (ring.min_id(), ring.max().map(|m| m.id)) else {
            return ScaleoutQueryResult::empty();
        };

        let (start, gap) = match cursor {
            Some(c) if c >= max => return ScaleoutQueryResult::empty(),
            Some(c) if c >= min => match ring.position_after(c) {
                Some(position) => (position, false),
                None => return ScaleoutQueryResult::empty(),
            },
            Some(c) => ((0, 0), ring.last_evicted_id.is_some_and(|last| c < last)),
            None => ((0, 0), false),
        };

        let (mappings, has_more_data) = ring.collect_from(start, max_mappings);
        ScaleoutQueryResult {
            first_message_id: mappings.first().map(|m| m.id),
            mappings,
            has_more_data,
            gap,
        }
    }
}
