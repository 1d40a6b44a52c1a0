//! The atom table, the UCN counter and the index registry.
//!
//! Everything in [`State`] sits behind one mutex. The current UCN is also
//! mirrored into an atomic so that hot read paths (index catch-up checks,
//! snapshots) do not have to take the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use atom::Atom;
use atomfile::{AtomDataFileError, ExpansionRecord};
use config::UcnOrder;
use parking_lot::Mutex;
use tracing::debug;

use crate::index::{Index, IndexInfo};
use crate::UniverseError;

/// UCN assigned to the first commit of a fresh store.
pub const FIRST_UCN: u64 = 1;

/// Content of one slot of the atom table.
#[derive(Debug, Clone)]
pub enum Slot {
    /// Permanently empty: discarded, rolled back or never filled.
    Never,
    /// Reserved by an open expansion.
    Pending,
    Committed(Arc<Atom>),
}

/// Slots handed to an index catching up, copied under one lock so they agree
/// with `ucn`.
pub(crate) struct SlotsView {
    pub ucn: u64,
    /// Table length at the time of the copy.
    pub len: u64,
    /// Slots `from..len`.
    pub fresh: Vec<Slot>,
    /// Current content of the requested earlier slots.
    pub revisited: Vec<(u64, Slot)>,
}

struct StateInner {
    table: Vec<Slot>,
    /// UCN the next commit receives.
    ucn: u64,
    committed: usize,
    indices: Vec<Arc<Index>>,
}

/// The single authority over the atom table.
pub struct State {
    inner: Mutex<StateInner>,
    ucn: AtomicU64,
    global: Arc<Index>,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("State")
            .field("ucn", &inner.ucn)
            .field("slots", &inner.table.len())
            .field("committed", &inner.committed)
            .field("indices", &inner.indices.len())
            .finish()
    }
}

impl State {
    /// Creates an empty state whose global index orders by `global_order`.
    pub fn new(global_order: UcnOrder) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<State>| {
            let global = Arc::new(Index::new(weak.clone(), IndexInfo::global(global_order)));
            State {
                inner: Mutex::new(StateInner {
                    table: Vec::new(),
                    ucn: FIRST_UCN,
                    committed: 0,
                    indices: vec![Arc::clone(&global)],
                }),
                ucn: AtomicU64::new(FIRST_UCN),
                global,
            }
        })
    }

    /// UCN the next commit will receive. Every committed atom has a smaller
    /// one.
    pub fn ucn(&self) -> u64 {
        self.ucn.load(Ordering::Acquire)
    }

    /// Number of slots ever allocated.
    pub fn slot_count(&self) -> u64 {
        self.inner.lock().table.len() as u64
    }

    /// Number of committed atoms.
    pub fn atom_count(&self) -> usize {
        self.inner.lock().committed
    }

    /// Reserves a new pending slot and returns its id.
    pub fn allocate_slot(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.table.push(Slot::Pending);
        inner.table.len() as u64 - 1
    }

    /// The committed atom in slot `id`. Pending and empty slots read as
    /// absent.
    pub fn get_atom(&self, id: u64) -> Option<Arc<Atom>> {
        match self.get_atom_or_special(id) {
            Slot::Committed(atom) => Some(atom),
            _ => None,
        }
    }

    /// Raw content of slot `id`; ids past the end of the table are
    /// [`Slot::Never`].
    pub fn get_atom_or_special(&self, id: u64) -> Slot {
        let inner = self.inner.lock();
        usize::try_from(id)
            .ok()
            .and_then(|i| inner.table.get(i))
            .cloned()
            .unwrap_or(Slot::Never)
    }

    /// Publishes `atoms`, which must all be sealed with the current UCN and
    /// occupy pending slots, then advances the UCN.
    ///
    /// Nothing is published unless every slot checks out.
    pub fn commit_and_advance_ucn(&self, atoms: Vec<Atom>) -> Result<Vec<Arc<Atom>>, UniverseError> {
        let mut inner = self.inner.lock();
        let ucn = inner.ucn;
        for atom in &atoms {
            let pending = matches!(slot_mut(&mut inner.table, atom.id()), Some(Slot::Pending));
            if !pending || atom.ucn() != ucn {
                return Err(UniverseError::SlotNotPending(atom.id()));
            }
        }

        let mut published = Vec::with_capacity(atoms.len());
        for atom in atoms {
            let atom = Arc::new(atom);
            if let Some(slot) = slot_mut(&mut inner.table, atom.id()) {
                *slot = Slot::Committed(Arc::clone(&atom));
            }
            published.push(atom);
        }
        inner.committed += published.len();
        inner.ucn = ucn + 1;
        self.ucn.store(inner.ucn, Ordering::Release);
        Ok(published)
    }

    /// Empties a pending slot for good.
    pub fn forget_atom(&self, id: u64) -> Result<(), UniverseError> {
        let mut inner = self.inner.lock();
        match slot_mut(&mut inner.table, id) {
            Some(slot @ Slot::Pending) => {
                *slot = Slot::Never;
                Ok(())
            }
            _ => Err(UniverseError::SlotNotPending(id)),
        }
    }

    /// Registers a new index. Names are unique within a store.
    pub fn add_index(self: &Arc<Self>, info: IndexInfo) -> Result<Arc<Index>, UniverseError> {
        let mut inner = self.inner.lock();
        if inner.indices.iter().any(|i| i.info().name == info.name) {
            return Err(UniverseError::DuplicateIndex(info.name));
        }
        let index = Arc::new(Index::new(Arc::downgrade(self), info));
        inner.indices.push(Arc::clone(&index));
        Ok(index)
    }

    /// Every registered index, the global one first.
    pub fn indices(&self) -> Vec<Arc<Index>> {
        self.inner.lock().indices.clone()
    }

    pub fn index_by_name(&self, name: &str) -> Option<Arc<Index>> {
        self.inner
            .lock()
            .indices
            .iter()
            .find(|i| i.info().name == name)
            .cloned()
    }

    pub fn index_by_id(&self, id: u32) -> Option<Arc<Index>> {
        self.inner
            .lock()
            .indices
            .iter()
            .find(|i| i.id() == id)
            .cloned()
    }

    pub fn global_index(&self) -> &Arc<Index> {
        &self.global
    }

    /// Applies one record read back from the data file.
    ///
    /// Slots skipped by the record (allocated but never committed before the
    /// file was written) are filled with [`Slot::Pending`] until
    /// [`clean_pending_atoms`](Self::clean_pending_atoms) runs.
    pub fn expansion_read(&self, record: ExpansionRecord) -> Result<(), AtomDataFileError> {
        let mut inner = self.inner.lock();
        if record.ucn < inner.ucn {
            return Err(AtomDataFileError::UcnOutOfOrder {
                offset: record.offset,
                ucn: record.ucn,
                expected: inner.ucn,
            });
        }

        let count = record.atoms.len();
        for atom in record.atoms {
            let id = atom.id();
            let i = usize::try_from(id).map_err(|_| AtomDataFileError::Corrupt {
                offset: record.offset,
                reason: format!("atom id {} out of range", id),
            })?;
            if inner.table.len() <= i {
                inner.table.resize(i + 1, Slot::Pending);
            }
            if let Slot::Committed(_) = inner.table[i] {
                return Err(AtomDataFileError::DuplicateAtom {
                    id,
                    offset: record.offset,
                });
            }
            inner.table[i] = Slot::Committed(Arc::new(atom));
        }
        inner.committed += count;
        inner.ucn = record.ucn + 1;
        self.ucn.store(inner.ucn, Ordering::Release);
        Ok(())
    }

    /// Turns every slot still pending into [`Slot::Never`]; returns how many
    /// there were.
    pub fn clean_pending_atoms(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut cleaned = 0;
        for slot in inner.table.iter_mut() {
            if matches!(slot, Slot::Pending) {
                *slot = Slot::Never;
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            debug!(cleaned, "dropped slots left pending by replay");
        }
        cleaned
    }

    pub(crate) fn slots_since(&self, from: u64, revisit: &[u64]) -> SlotsView {
        let inner = self.inner.lock();
        let len = inner.table.len() as u64;
        let start = from.min(len) as usize;
        SlotsView {
            ucn: inner.ucn,
            len,
            fresh: inner.table[start..].to_vec(),
            revisited: revisit
                .iter()
                .map(|&id| {
                    let slot = inner.table.get(id as usize).cloned().unwrap_or(Slot::Never);
                    (id, slot)
                })
                .collect(),
        }
    }
}

fn slot_mut(table: &mut [Slot], id: u64) -> Option<&mut Slot> {
    usize::try_from(id).ok().and_then(move |i| table.get_mut(i))
}
