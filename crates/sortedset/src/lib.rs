//! # CompactingSortedSet
//!
//! A sorted set split into two tiers:
//!
//! ```text
//! ┌──────────────────────────┐   small, mutable, O(log n) insert
//! │ tree  (BTreeSet<T>)      │
//! ├──────────────────────────┤   large, immutable once built, shared
//! │ array (Arc<Vec<T>>)      │   with running iterators
//! └──────────────────────────┘
//! ```
//!
//! Every element lives in exactly one tier. Inserts go to the tree; once the
//! tree holds more than [`MERGE_THRESHOLD`] elements it is merged into a new
//! array with a single linear merge and discarded. Large batches can bypass
//! the tree entirely with [`start_adding`](CompactingSortedSet::start_adding) /
//! [`stop_adding`](CompactingSortedSet::stop_adding): values are buffered,
//! sorted once and merged into the array once.
//!
//! The set is ordered by `T: Ord` (the *strict* order, which must never
//! report two distinct elements as equal). Lookups by a coarser *loose* key
//! are expressed as "first element at or after a lower bound that satisfies a
//! predicate", see [`search_exact`](CompactingSortedSet::search_exact).
//!
//! [`ConcurrentSortedSetIterator`] walks a set that is shared behind a
//! `RwLock` and tolerates inserts made between its steps.

mod iter;

pub use iter::{ConcurrentSortedSetIterator, SharedSortedSet, MAX_RETRIES};

use std::collections::btree_set;
use std::collections::BTreeSet;
use std::iter::Peekable;
use std::ops::Bound::{Included, Unbounded};
use std::sync::Arc;

use thiserror::Error;

/// Number of tree elements above which the tree is merged into the array.
pub const MERGE_THRESHOLD: usize = 1000;

/// Errors surfaced by readers of a shared sorted set.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SortedSetError {
    /// The set stayed locked by a writer for every retry attempt. The caller
    /// should restart the read.
    #[error("sorted set kept changing under the iterator, gave up after {retries} retries")]
    Conflict { retries: u32 },
}

/// Hybrid tree + sorted array set.
#[derive(Debug, Clone)]
pub struct CompactingSortedSet<T> {
    tree: BTreeSet<T>,
    array: Arc<Vec<T>>,
    /// Bulk-load buffer; `Some` between `start_adding` and `stop_adding`.
    adding: Option<Vec<T>>,
    threshold: usize,
}

impl<T: Ord + Clone> CompactingSortedSet<T> {
    pub fn new() -> Self {
        Self::with_threshold(MERGE_THRESHOLD)
    }

    /// Creates a set that merges its tree once it exceeds `threshold` elements.
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            tree: BTreeSet::new(),
            array: Arc::new(Vec::new()),
            adding: None,
            threshold: threshold.max(1),
        }
    }

    /// Number of elements in both tiers. Values buffered by an unfinished
    /// bulk load are not counted.
    pub fn len(&self) -> usize {
        self.tree.len() + self.array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty() && self.array.is_empty()
    }

    pub fn contains(&self, value: &T) -> bool {
        self.array.binary_search(value).is_ok() || self.tree.contains(value)
    }

    /// Inserts `value`. Returns `false` if it was already present.
    ///
    /// While a bulk load is active the value is only buffered and `true` is
    /// returned; duplicates are dropped when the load finishes.
    pub fn add(&mut self, value: T) -> bool {
        if let Some(buf) = self.adding.as_mut() {
            buf.push(value);
            return true;
        }
        if self.array.binary_search(&value).is_ok() || !self.tree.insert(value) {
            return false;
        }
        if self.tree.len() > self.threshold {
            self.merge_tree();
        }
        true
    }

    /// Begins a bulk load sized for roughly `estimated_count` values.
    /// Calling it while a load is already active has no effect.
    pub fn start_adding(&mut self, estimated_count: usize) {
        if self.adding.is_none() {
            self.adding = Some(Vec::with_capacity(estimated_count));
        }
    }

    #[must_use]
    pub fn is_adding(&self) -> bool {
        self.adding.is_some()
    }

    /// Finishes a bulk load: sorts the buffered values once and merges them
    /// into the array in one linear pass.
    pub fn stop_adding(&mut self) {
        let Some(mut buf) = self.adding.take() else {
            return;
        };
        if buf.is_empty() {
            return;
        }
        buf.sort_unstable();
        buf.dedup();
        buf.retain(|v| !self.tree.contains(v));
        let merged = merge_sorted(&self.array, buf);
        self.array = Arc::new(merged);
    }

    fn merge_tree(&mut self) {
        let tree = std::mem::take(&mut self.tree);
        self.array = Arc::new(merge_sorted(&self.array, tree));
    }

    /// Smallest element.
    pub fn first(&self) -> Option<&T> {
        min_of(self.array.first(), self.tree.first())
    }

    /// Largest element.
    pub fn last(&self) -> Option<&T> {
        match (self.array.last(), self.tree.last()) {
            (Some(a), Some(t)) => Some(if t > a { t } else { a }),
            (a, t) => a.or(t),
        }
    }

    /// First element that is `>= lower`.
    pub fn ceiling(&self, lower: &T) -> Option<&T> {
        let idx = self.array.partition_point(|x| x < lower);
        min_of(
            self.array.get(idx),
            self.tree.range((Included(lower), Unbounded)).next(),
        )
    }

    /// Finds the element loosely equal to a sample.
    ///
    /// `lower` must be the strict-order lower bound of the sample's loose
    /// group and `matches` must accept exactly the members of that group.
    /// When both tiers hold a match, the one that sorts first wins.
    pub fn search_exact<P>(&self, lower: &T, matches: P) -> Option<&T>
    where
        P: Fn(&T) -> bool,
    {
        let idx = self.array.partition_point(|x| x < lower);
        let in_array = self.array.get(idx).filter(|v| matches(*v));
        let in_tree = self
            .tree
            .range((Included(lower), Unbounded))
            .next()
            .filter(|v| matches(*v));
        min_of(in_array, in_tree)
    }

    /// Ordered iterator over every element.
    pub fn iter(&self) -> Iter<'_, T> {
        self.iter_from(None)
    }

    /// Ordered iterator starting at the first element `>= lower`.
    pub fn iter_from(&self, lower: Option<&T>) -> Iter<'_, T> {
        let start = lower.map_or(0, |lo| self.array.partition_point(|x| x < lo));
        let tree = match lower {
            Some(lo) => self.tree.range((Included(lo), Unbounded)),
            None => self.tree.range::<T, _>(..),
        };
        Iter {
            array: self.array[start..].iter().peekable(),
            tree: tree.peekable(),
        }
    }

    pub(crate) fn array(&self) -> &Arc<Vec<T>> {
        &self.array
    }

    pub(crate) fn tree(&self) -> &BTreeSet<T> {
        &self.tree
    }
}

impl<T: Ord + Clone> Default for CompactingSortedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowing merged iterator over both tiers.
pub struct Iter<'a, T> {
    array: Peekable<std::slice::Iter<'a, T>>,
    tree: Peekable<btree_set::Range<'a, T>>,
}

impl<'a, T: Ord> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        match (self.array.peek(), self.tree.peek()) {
            (Some(a), Some(t)) => {
                if a <= t {
                    self.array.next()
                } else {
                    self.tree.next()
                }
            }
            (Some(_), None) => self.array.next(),
            (None, Some(_)) => self.tree.next(),
            (None, None) => None,
        }
    }
}

fn min_of<'a, T: Ord>(a: Option<&'a T>, b: Option<&'a T>) -> Option<&'a T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(if y < x { y } else { x }),
        (x, y) => x.or(y),
    }
}

/// Linear merge of a sorted slice with a sorted sequence. Values present in
/// both inputs are kept once.
fn merge_sorted<T, I>(array: &[T], other: I) -> Vec<T>
where
    T: Ord + Clone,
    I: IntoIterator<Item = T>,
{
    let other = other.into_iter();
    let mut out = Vec::with_capacity(array.len() + other.size_hint().0);
    let mut i = 0;

    for value in other {
        while i < array.len() && array[i] < value {
            out.push(array[i].clone());
            i += 1;
        }
        if i < array.len() && array[i] == value {
            i += 1;
        }
        out.push(value);
    }
    out.extend_from_slice(&array[i..]);
    out
}
