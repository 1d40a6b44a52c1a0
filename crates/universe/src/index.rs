//! Materialized, ordered views over committed atoms.
//!
//! An [`Index`] keeps the atoms accepted by its [`Condition`] in a
//! [`CompactingSortedSet`], ordered by:
//!
//! ```text
//! strict: (sort key values..., UCN in index order, atom id)
//! loose:  (sort key values...)
//! ```
//!
//! The strict order gives every atom its own position; the loose order groups
//! atoms that agree on all sort keys and is what `search_exact` and `search`
//! match against.
//!
//! Indices catch up lazily. Every read first calls [`Index::update`], which
//! scans the slots appended since the last scan plus the slots that were
//! still pending back then (the "ethereal" ones).

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use atom::{Atom, AttrKey, Junctions, Particle};
use config::UcnOrder;
use parking_lot::{Mutex, RwLock};
use sortedset::{
    CompactingSortedSet, ConcurrentSortedSetIterator, SharedSortedSet, SortedSetError,
    MERGE_THRESHOLD,
};
use tracing::debug;

use crate::state::{Slot, State};

/// Name of the index every store creates over all atoms.
pub const GLOBAL_INDEX_NAME: &str = "global";

/// Batches larger than this are inserted through the sorted set's bulk mode.
const BULK_LOAD_THRESHOLD: usize = MERGE_THRESHOLD;

static NEXT_INDEX_ID: AtomicU32 = AtomicU32::new(1);

/// Acceptance test deciding which atoms an index holds.
#[derive(Clone)]
pub enum Condition {
    Always,
    HasKey(AttrKey),
    Equals(AttrKey, Particle),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Custom(Arc<dyn Fn(&Atom) -> bool + Send + Sync>),
}

impl Condition {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Atom) -> bool + Send + Sync + 'static,
    {
        Condition::Custom(Arc::new(f))
    }

    pub fn accepts(&self, atom: &Atom) -> bool {
        match self {
            Condition::Always => true,
            Condition::HasKey(key) => atom.value(*key).is_some(),
            Condition::Equals(key, expected) => atom.value(*key) == Some(expected),
            Condition::And(all) => all.iter().all(|c| c.accepts(atom)),
            Condition::Or(any) => any.iter().any(|c| c.accepts(atom)),
            Condition::Not(inner) => !inner.accepts(atom),
            Condition::Custom(f) => f(atom),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Always => write!(f, "Always"),
            Condition::HasKey(k) => write!(f, "HasKey({})", k),
            Condition::Equals(k, v) => write!(f, "Equals({}, {})", k, v),
            Condition::And(all) => f.debug_tuple("And").field(all).finish(),
            Condition::Or(any) => f.debug_tuple("Or").field(any).finish(),
            Condition::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
            Condition::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Definition of an index.
///
/// ```rust
/// use universe::{Condition, IndexInfo, UcnOrder};
///
/// let info = IndexInfo::new("by-owner")
///     .condition(Condition::HasKey(1))
///     .sort_by(1)
///     .order(UcnOrder::Ascending);
/// assert_eq!(info.sort_keys, vec![1]);
/// ```
#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub name: String,
    pub condition: Condition,
    /// Junction keys compared in order; a missing value sorts first.
    pub sort_keys: Vec<AttrKey>,
    /// Order of atoms that tie on every sort key.
    pub ucn_order: UcnOrder,
    /// Only atoms with `min_ucn <= ucn < max_ucn` are held.
    pub min_ucn: u64,
    pub max_ucn: u64,
}

impl IndexInfo {
    /// An index over every atom, newest first, with no sort keys.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition: Condition::Always,
            sort_keys: Vec::new(),
            ucn_order: UcnOrder::Descending,
            min_ucn: 0,
            max_ucn: u64::MAX,
        }
    }

    pub(crate) fn global(order: UcnOrder) -> Self {
        Self::new(GLOBAL_INDEX_NAME).order(order)
    }

    #[must_use]
    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    /// Appends a sort key.
    #[must_use]
    pub fn sort_by(mut self, key: AttrKey) -> Self {
        self.sort_keys.push(key);
        self
    }

    #[must_use]
    pub fn order(mut self, order: UcnOrder) -> Self {
        self.ucn_order = order;
        self
    }

    #[must_use]
    pub fn ucn_range(mut self, range: Range<u64>) -> Self {
        self.min_ucn = range.start;
        self.max_ucn = range.end;
        self
    }

    fn accepts(&self, atom: &Atom) -> bool {
        (self.min_ucn..self.max_ucn).contains(&atom.ucn()) && self.condition.accepts(atom)
    }

    fn fields<J: Junctions + ?Sized>(&self, atom: &J) -> Vec<Option<Particle>> {
        self.sort_keys
            .iter()
            .map(|k| atom.value(*k).cloned())
            .collect()
    }

    fn ucn_rank(&self, ucn: u64) -> u64 {
        match self.ucn_order {
            UcnOrder::Ascending => ucn,
            UcnOrder::Descending => u64::MAX - ucn,
        }
    }

    fn entry(&self, atom: Arc<Atom>) -> IndexEntry {
        IndexEntry {
            key: IndexKey {
                fields: self.fields(atom.as_ref()),
                ucn_rank: self.ucn_rank(atom.ucn()),
                id: atom.id(),
            },
            atom,
        }
    }

    /// Strict-order lower bound of the loose group `sample` belongs to.
    fn lower_bound<J: Junctions + ?Sized>(&self, sample: &J) -> IndexEntry {
        IndexEntry {
            key: IndexKey {
                fields: self.fields(sample),
                ucn_rank: 0,
                id: 0,
            },
            atom: Arc::new(atom::AtomBuilder::sample().seal(u64::MAX)),
        }
    }
}

/// Position of an atom in an index. The derived order is the strict one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct IndexKey {
    fields: Vec<Option<Particle>>,
    ucn_rank: u64,
    id: u64,
}

/// Element of an index's sorted set.
#[derive(Debug, Clone)]
struct IndexEntry {
    key: IndexKey,
    atom: Arc<Atom>,
}

impl IndexEntry {
    fn loosely_equals(&self, other: &IndexEntry) -> bool {
        self.key.fields == other.key.fields
    }
}

impl PartialEq for IndexEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for IndexEntry {}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

#[derive(Debug, Default)]
struct Cursor {
    /// State UCN at the last scan.
    last_ucn: u64,
    /// Table length at the last scan.
    scanned: u64,
    /// Slots that were pending at the last scan.
    ethereal: BTreeSet<u64>,
}

/// A lazily maintained ordered view over committed atoms.
pub struct Index {
    id: u32,
    info: IndexInfo,
    state: Weak<State>,
    cursor: Mutex<Cursor>,
    set: SharedSortedSet<IndexEntry>,
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cursor = self.cursor.lock();
        f.debug_struct("Index")
            .field("id", &self.id)
            .field("name", &self.info.name)
            .field("last_ucn", &cursor.last_ucn)
            .field("ethereal", &cursor.ethereal.len())
            .field("entries", &self.set.read().len())
            .finish()
    }
}

impl Index {
    pub(crate) fn new(state: Weak<State>, info: IndexInfo) -> Self {
        Self {
            id: NEXT_INDEX_ID.fetch_add(1, Ordering::Relaxed),
            info,
            state,
            cursor: Mutex::new(Cursor::default()),
            set: Arc::new(RwLock::new(CompactingSortedSet::new())),
        }
    }

    /// Process-wide unique id of this index.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn info(&self) -> &IndexInfo {
        &self.info
    }

    /// Brings the index up to date with every commit made so far.
    pub fn update(&self) {
        self.catch_up();
    }

    /// Catches up and returns the UCN the index now reflects.
    fn catch_up(&self) -> u64 {
        let mut cursor = self.cursor.lock();
        let Some(state) = self.state.upgrade() else {
            return cursor.last_ucn;
        };
        if cursor.last_ucn >= state.ucn() {
            return cursor.last_ucn;
        }

        let revisit: Vec<u64> = cursor.ethereal.iter().copied().collect();
        let view = state.slots_since(cursor.scanned, &revisit);
        let mut accepted = Vec::new();

        for (id, slot) in view.revisited {
            match slot {
                Slot::Pending => {}
                Slot::Never => {
                    cursor.ethereal.remove(&id);
                }
                Slot::Committed(atom) => {
                    cursor.ethereal.remove(&id);
                    if self.info.accepts(&atom) {
                        accepted.push(atom);
                    }
                }
            }
        }
        let base = cursor.scanned;
        for (offset, slot) in view.fresh.into_iter().enumerate() {
            match slot {
                Slot::Never => {}
                Slot::Pending => {
                    cursor.ethereal.insert(base + offset as u64);
                }
                Slot::Committed(atom) => {
                    if self.info.accepts(&atom) {
                        accepted.push(atom);
                    }
                }
            }
        }
        cursor.scanned = view.len;
        cursor.last_ucn = view.ucn;

        if !accepted.is_empty() {
            let count = accepted.len();
            let mut set = self.set.write();
            if count > BULK_LOAD_THRESHOLD {
                set.start_adding(count);
                for atom in accepted {
                    set.add(self.info.entry(atom));
                }
                set.stop_adding();
            } else {
                for atom in accepted {
                    set.add(self.info.entry(atom));
                }
            }
            debug!(index = %self.info.name, added = count, ucn = view.ucn, "index caught up");
        }
        cursor.last_ucn
    }

    /// Number of atoms in the index.
    pub fn len(&self) -> usize {
        self.update();
        self.set.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first(&self) -> Option<Arc<Atom>> {
        self.update();
        self.set.read().first().map(|e| Arc::clone(&e.atom))
    }

    pub fn last(&self) -> Option<Arc<Atom>> {
        self.update();
        self.set.read().last().map(|e| Arc::clone(&e.atom))
    }

    /// The first atom, in strict order, whose sort key values equal those of
    /// `sample`.
    pub fn search_exact<J: Junctions + ?Sized>(&self, sample: &J) -> Option<Arc<Atom>> {
        self.update();
        let lower = self.info.lower_bound(sample);
        self.set
            .read()
            .search_exact(&lower, |e| e.loosely_equals(&lower))
            .map(|e| Arc::clone(&e.atom))
    }

    /// Ordered iterator starting at the first atom whose sort key values are
    /// `>=` those of `sample`.
    pub fn search<J: Junctions + ?Sized>(&self, sample: &J) -> IndexIter {
        let snapshot = self.catch_up();
        IndexIter {
            inner: ConcurrentSortedSetIterator::new(
                Arc::clone(&self.set),
                Some(self.info.lower_bound(sample)),
            ),
            snapshot,
        }
    }

    /// Ordered iterator over the whole index.
    pub fn all(&self) -> IndexIter {
        let snapshot = self.catch_up();
        IndexIter {
            inner: ConcurrentSortedSetIterator::new(Arc::clone(&self.set), None),
            snapshot,
        }
    }
}

/// Iterator returned by [`Index::all`] and [`Index::search`].
///
/// Only atoms committed before the iterator was created are yielded, even if
/// the index catches up with later commits while it is being drained.
pub struct IndexIter {
    inner: ConcurrentSortedSetIterator<IndexEntry>,
    snapshot: u64,
}

impl IndexIter {
    /// Collects the remaining atoms, stopping at the first conflict.
    pub fn to_vec(self) -> Result<Vec<Arc<Atom>>, SortedSetError> {
        self.collect()
    }
}

impl Iterator for IndexIter {
    type Item = Result<Arc<Atom>, SortedSetError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(entry) if entry.atom.ucn() < self.snapshot => return Some(Ok(entry.atom)),
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
