//! Transactions.
//!
//! An [`Expansion`] reserves slots, builds atoms in them and then either
//! commits them all under one new UCN or returns every slot to
//! [`Slot::Never`](crate::Slot::Never).
//!
//! ## Commit sequence
//!
//! Everything below runs while holding the store's commit mutex:
//!
//! ```text
//! 1. drop atoms marked Discarding          (slot -> Never)
//! 2. run verifiers in registration order   (first failure aborts)
//! 3. take the current UCN
//! 4. append the record to the data file    (skipped for in-memory stores)
//! 5. point large byte junctions at their file-hosted copy
//! 6. seal, publish, advance the UCN
//! 7. hand the published atoms to the callback
//! ```
//!
//! A failure in steps 2 or 4 forgets every slot of the expansion, so nothing
//! it built ever becomes visible.

use std::collections::BTreeMap;
use std::sync::Arc;

use atom::{Atom, AtomBuilder, AttrKey, Particle};
use tracing::{debug, warn};

use crate::{CommitError, Universe, UniverseError};

/// Handle to an atom under construction in an [`Expansion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomHandle(u64);

impl AtomHandle {
    /// The slot the atom will occupy once committed.
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Fate of a pending atom at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Building,
    /// Dropped at commit unless referred before then.
    Discarding,
    /// Kept at commit, even if discarded.
    Referred,
}

#[derive(Debug)]
struct PendingAtom {
    builder: AtomBuilder,
    mark: Mark,
}

type Verifier<'u> = Box<dyn FnOnce() -> anyhow::Result<()> + 'u>;

/// Outcome of a successful commit.
#[derive(Debug, Clone)]
pub struct Committed {
    /// UCN given to the atoms; `None` when nothing was left to commit.
    pub ucn: Option<u64>,
    pub atoms: Vec<Arc<Atom>>,
}

/// One transaction against a [`Universe`].
///
/// Dropping an expansion without committing rolls it back.
pub struct Expansion<'u> {
    universe: &'u Universe,
    start_ucn: u64,
    atoms: BTreeMap<u64, PendingAtom>,
    verifiers: Vec<Verifier<'u>>,
    finished: bool,
}

impl std::fmt::Debug for Expansion<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Expansion")
            .field("start_ucn", &self.start_ucn)
            .field("atoms", &self.atoms.len())
            .field("verifiers", &self.verifiers.len())
            .finish()
    }
}

impl<'u> Expansion<'u> {
    pub(crate) fn new(universe: &'u Universe) -> Self {
        Self {
            universe,
            start_ucn: universe.state().ucn(),
            atoms: BTreeMap::new(),
            verifiers: Vec::new(),
            finished: false,
        }
    }

    /// UCN of the store when the expansion began.
    pub fn start_ucn(&self) -> u64 {
        self.start_ucn
    }

    /// Reserves a fresh slot and starts building an atom in it.
    pub fn create_atom(&mut self) -> AtomHandle {
        let id = self.universe.state().allocate_slot();
        self.atoms.insert(
            id,
            PendingAtom {
                builder: AtomBuilder::new(id),
                mark: Mark::Building,
            },
        );
        AtomHandle(id)
    }

    /// The atom being built behind `handle`.
    pub fn atom(&self, handle: AtomHandle) -> Option<&AtomBuilder> {
        self.atoms.get(&handle.0).map(|p| &p.builder)
    }

    pub fn atom_mut(&mut self, handle: AtomHandle) -> Result<&mut AtomBuilder, UniverseError> {
        self.pending_mut(handle.0).map(|p| &mut p.builder)
    }

    /// Binds `key` to `value` on a pending atom, returning the value it
    /// replaces.
    pub fn add_junction(
        &mut self,
        handle: AtomHandle,
        key: AttrKey,
        value: impl Into<Particle>,
    ) -> Result<Option<Particle>, UniverseError> {
        Ok(self.atom_mut(handle)?.add_junction(key, value))
    }

    /// Marks an atom to be dropped at commit.
    pub fn discard_atom(&mut self, handle: AtomHandle) -> Result<(), UniverseError> {
        let pending = self.pending_mut(handle.0)?;
        if pending.mark == Mark::Building {
            pending.mark = Mark::Discarding;
        }
        Ok(())
    }

    /// Marks an atom as still needed, which cancels a discard.
    pub fn atom_referred(&mut self, id: u64) -> Result<(), UniverseError> {
        self.pending_mut(id)?.mark = Mark::Referred;
        Ok(())
    }

    /// Registers a check run at commit, after discards are resolved and
    /// before anything is written. An `Err` aborts the commit.
    ///
    /// Verifiers run under the commit mutex and must not commit themselves.
    pub fn add_verifier<F>(&mut self, verifier: F)
    where
        F: FnOnce() -> anyhow::Result<()> + 'u,
    {
        self.verifiers.push(Box::new(verifier));
    }

    pub fn commit(mut self) -> Result<Committed, CommitError> {
        self.finish(|_| ())
    }

    /// Commits and hands the published atoms (possibly none) to
    /// `on_committed` while the commit mutex is still held.
    pub fn commit_with<F>(mut self, on_committed: F) -> Result<Committed, CommitError>
    where
        F: FnOnce(&[Arc<Atom>]),
    {
        self.finish(on_committed)
    }

    /// Returns every slot of the expansion to `Never`.
    pub fn rollback(mut self) {
        self.abandon();
    }

    fn pending_mut(&mut self, id: u64) -> Result<&mut PendingAtom, UniverseError> {
        self.atoms.get_mut(&id).ok_or(UniverseError::UnknownAtom(id))
    }

    fn abandon(&mut self) {
        self.finished = true;
        self.verifiers.clear();
        let atoms = std::mem::take(&mut self.atoms);
        if !atoms.is_empty() {
            debug!(atoms = atoms.len(), "rolling back expansion");
        }
        self.forget(atoms.into_keys());
    }

    fn forget(&self, ids: impl IntoIterator<Item = u64>) {
        let state = self.universe.state();
        for id in ids {
            if let Err(e) = state.forget_atom(id) {
                warn!(id, error = %e, "could not release slot");
            }
        }
    }

    fn finish<F>(&mut self, on_committed: F) -> Result<Committed, CommitError>
    where
        F: FnOnce(&[Arc<Atom>]),
    {
        self.finished = true;
        let atoms = std::mem::take(&mut self.atoms);
        let verifiers = std::mem::take(&mut self.verifiers);

        if self.universe.is_read_only() {
            self.forget(atoms.into_keys());
            return Err(CommitError::ReadOnly);
        }

        let universe = self.universe;
        let state = universe.state();
        let mut journal = universe.journal.lock();

        let mut kept = Vec::with_capacity(atoms.len());
        let mut dropped = Vec::new();
        for (id, pending) in atoms {
            match pending.mark {
                Mark::Discarding => dropped.push(id),
                Mark::Building | Mark::Referred => kept.push(pending.builder),
            }
        }
        self.forget(dropped);

        for verifier in verifiers {
            if let Err(e) = verifier() {
                warn!(error = %e, "verifier rejected expansion");
                self.forget(kept.iter().map(AtomBuilder::id));
                return Err(CommitError::Verification(e));
            }
        }

        if kept.is_empty() {
            on_committed(&[]);
            return Ok(Committed {
                ucn: None,
                atoms: Vec::new(),
            });
        }

        let ucn = state.ucn();
        if let Some(file) = journal.as_mut() {
            let hosted = match file.append_expansion(ucn, &kept, universe.config.file_hosted_threshold) {
                Ok(hosted) => hosted,
                Err(e) => {
                    self.forget(kept.iter().map(AtomBuilder::id));
                    return Err(CommitError::Durability(e));
                }
            };
            // kept is ordered by slot id
            for h in hosted {
                if let Ok(i) = kept.binary_search_by_key(&h.atom_id, AtomBuilder::id) {
                    kept[i].add_junction(h.key, h.particle());
                }
            }
        }

        let sealed = kept.into_iter().map(|b| b.seal(ucn)).collect();
        let published = state.commit_and_advance_ucn(sealed)?;
        debug!(ucn, atoms = published.len(), "committed expansion");
        on_committed(&published);
        drop(journal);

        if universe.is_default_indexing() {
            for index in state.indices() {
                index.update();
            }
        }
        Ok(Committed {
            ucn: Some(ucn),
            atoms: published,
        })
    }
}

impl Drop for Expansion<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.abandon();
        }
    }
}
