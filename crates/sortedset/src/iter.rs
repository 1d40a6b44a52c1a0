//! Iterator over a [`CompactingSortedSet`] shared between threads.
//!
//! The iterator never holds the lock between steps. Each step takes a read
//! lock, resumes strictly after the last value it returned, and releases the
//! lock again, so inserts and tree→array merges made by other threads in the
//! meantime neither invalidate it nor make it yield a value twice.
//!
//! A step that cannot get the read lock within [`MAX_RETRIES`] attempts
//! returns [`SortedSetError::Conflict`] and ends the iteration.

use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::warn;

use crate::{CompactingSortedSet, SortedSetError};

/// Attempts made to acquire a consistent view before giving up.
pub const MAX_RETRIES: u32 = 20;

/// How long a single attempt waits for a writer to finish.
const RETRY_WAIT: Duration = Duration::from_millis(5);

/// A sorted set shared between an owner that mutates it and any number of
/// concurrent iterators.
pub type SharedSortedSet<T> = Arc<RwLock<CompactingSortedSet<T>>>;

/// Ordered iterator over a [`SharedSortedSet`] that tolerates concurrent
/// insertion.
///
/// Yields `Ok(value)` in strict order, each value at most once. Values
/// inserted behind the cursor are not seen; values inserted ahead of it are.
pub struct ConcurrentSortedSetIterator<T> {
    set: SharedSortedSet<T>,
    /// Inclusive start, used until the first value is returned.
    lower: Option<T>,
    last: Option<T>,
    /// Array tier the cursor position refers to.
    array: Arc<Vec<T>>,
    pos: usize,
    done: bool,
}

impl<T: Ord + Clone> ConcurrentSortedSetIterator<T> {
    /// Creates an iterator starting at the first value `>= lower`, or at the
    /// first value of the set when `lower` is `None`.
    pub fn new(set: SharedSortedSet<T>, lower: Option<T>) -> Self {
        Self {
            set,
            lower,
            last: None,
            array: Arc::new(Vec::new()),
            pos: 0,
            done: false,
        }
    }

    /// The last value returned, if any.
    pub fn last_returned(&self) -> Option<&T> {
        self.last.as_ref()
    }

    fn step(&mut self) -> Result<Option<T>, SortedSetError> {
        let set = read_with_retries(&self.set)?;

        if !Arc::ptr_eq(&self.array, set.array()) {
            // the array was rebuilt by a merge, find our place again
            self.array = Arc::clone(set.array());
            self.pos = match (&self.last, &self.lower) {
                (Some(last), _) => self.array.partition_point(|x| x <= last),
                (None, Some(lower)) => self.array.partition_point(|x| x < lower),
                (None, None) => 0,
            };
        }

        let from_tree = match (&self.last, &self.lower) {
            (Some(last), _) => set.tree().range((Excluded(last), Unbounded)).next(),
            (None, Some(lower)) => set.tree().range((Included(lower), Unbounded)).next(),
            (None, None) => set.tree().first(),
        };

        let next = match (self.array.get(self.pos), from_tree) {
            (Some(a), Some(t)) if t < a => t.clone(),
            (Some(a), _) => {
                let a = a.clone();
                self.pos += 1;
                a
            }
            (None, Some(t)) => t.clone(),
            (None, None) => return Ok(None),
        };
        drop(set);

        self.last = Some(next.clone());
        Ok(Some(next))
    }
}

impl<T: Ord + Clone> Iterator for ConcurrentSortedSetIterator<T> {
    type Item = Result<T, SortedSetError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(v)) => Some(Ok(v)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn read_with_retries<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, SortedSetError> {
    for _ in 0..MAX_RETRIES {
        if let Some(guard) = lock.try_read_for(RETRY_WAIT) {
            return Ok(guard);
        }
    }
    warn!(retries = MAX_RETRIES, "sorted set iterator gave up waiting for a writer");
    Err(SortedSetError::Conflict {
        retries: MAX_RETRIES,
    })
}
