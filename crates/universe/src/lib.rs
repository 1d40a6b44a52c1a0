//! # Universe - embedded versioned atom store
//!
//! The façade that ties the [`atom`], [`sortedset`] and [`atomfile`] crates
//! into a store with a lifecycle and a read/write API.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌──────────────────────────────────────────────────┐
//! │                    UNIVERSE                      │
//! │                                                  │
//! │ begin() → Expansion                              │
//! │            create_atom / discard / verifiers     │
//! │              |                                   │
//! │              v   (commit mutex)                  │
//! │           commit() → data file append            │
//! │              |                                   │
//! │              v                                   │
//! │           State: seal, publish, UCN + 1          │
//! │                                                  │
//! │ get_atom() → State atom table                    │
//! │ Index::all() → update() → sorted set → atoms     │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module          | Purpose                                               |
//! |-----------------|-------------------------------------------------------|
//! | `lib.rs`        | `Universe` struct, lifecycle, accessors, `Debug`      |
//! | `state`         | atom table, UCN counter, index registry               |
//! | `expansion`     | transactions: build, discard, verify, commit, rollback |
//! | `index`         | conditions, index definitions, lazy catch-up, reads   |
//! | `recovery`      | data file replay and torn-tail repair                 |
//!
//! ## Lock Domains
//!
//! ```text
//! commit mutex   one per store, wraps the data file; serializes commits
//! payload mutex  one per store, wraps a second read handle on the file
//! state mutex    atom table + UCN + index registry
//! index mutex    one per index, serializes its catch-up
//! ```
//!
//! A commit takes the commit mutex, then the state mutex briefly. Index
//! catch-up takes its own mutex, then the state mutex briefly. No path takes
//! them the other way around. [`Universe::read_bytes`] takes only the payload
//! mutex, so verifiers and commit callbacks may call it while the commit
//! mutex is held.
//!
//! ## Example
//!
//! ```rust
//! use universe::{Universe, UniverseConfig};
//!
//! let store = Universe::in_memory(UniverseConfig::default());
//! let mut tx = store.begin();
//! let a = tx.create_atom();
//! tx.add_junction(a, 1, "hello").unwrap();
//! let committed = tx.commit().unwrap();
//!
//! let atom = store.get_atom(a.id()).unwrap();
//! assert_eq!(atom.value(1).and_then(|p| p.as_str()), Some("hello"));
//! assert_eq!(Some(atom.ucn()), committed.ucn);
//! ```

mod error;
mod expansion;
mod index;
mod recovery;
mod state;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atom::{Atom, Particle};
use atomfile::{AtomDataFile, FileHeader, HostedReader};
use parking_lot::Mutex;
use tracing::info;

pub use config::{UcnOrder, UniverseConfig};
pub use error::{CommitError, UniverseError};
pub use expansion::{AtomHandle, Committed, Expansion};
pub use index::{Condition, Index, IndexInfo, IndexIter, GLOBAL_INDEX_NAME};
pub use recovery::replay_into_state;
pub use state::{Slot, State, FIRST_UCN};

/// An open store.
///
/// `Universe` is `Send + Sync`; share it between threads by reference or
/// behind an `Arc`.
pub struct Universe {
    state: Arc<State>,
    /// The commit mutex. `None` for in-memory stores.
    pub(crate) journal: Mutex<Option<AtomDataFile>>,
    /// Payload reads. `None` for in-memory stores.
    hosted: Mutex<Option<HostedReader>>,
    header: Option<FileHeader>,
    pub(crate) config: UniverseConfig,
    read_only: AtomicBool,
    default_indexing: AtomicBool,
}

impl std::fmt::Debug for Universe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Universe")
            .field("path", &self.config.path)
            .field("store_id", &self.header.as_ref().map(|h| h.store_id))
            .field("ucn", &self.state.ucn())
            .field("atoms", &self.state.atom_count())
            .field("indices", &self.state.indices().len())
            .field("read_only", &self.is_read_only())
            .field("default_indexing", &self.is_default_indexing())
            .finish()
    }
}

impl Universe {
    /// Creates a new store at `config.path` with the given custom metadata.
    ///
    /// Fails if the file already exists.
    pub fn create(
        config: UniverseConfig,
        metadata: BTreeMap<String, String>,
    ) -> Result<Self, UniverseError> {
        let file = AtomDataFile::create(&config.path, metadata, config.sync)?;
        let state = State::new(config.global_order);
        info!(path = %config.path.display(), "created universe");
        Self::with_file(config, state, file)
    }

    /// Opens the store at `config.path` and replays its data file.
    ///
    /// # Recovery Steps
    ///
    /// 1. Validate the header (magic, CRC, version range).
    /// 2. Replay every record into a fresh [`State`].
    /// 3. Cut a torn last record if `config.repair_torn_tail` is set.
    /// 4. Empty every slot left pending.
    pub fn open(config: UniverseConfig) -> Result<Self, UniverseError> {
        let mut file = AtomDataFile::open(&config.path, config.sync, config.read_only)?;
        let state = State::new(config.global_order);
        replay_into_state(&mut file, &state, config.repair_torn_tail)?;
        info!(
            path = %config.path.display(),
            store_id = %file.header().store_id,
            ucn = state.ucn(),
            atoms = state.atom_count(),
            "opened universe"
        );
        Self::with_file(config, state, file)
    }

    /// Opens the store if its file exists, creates it otherwise.
    pub fn open_or_create(config: UniverseConfig) -> Result<Self, UniverseError> {
        if config.path.exists() {
            Self::open(config)
        } else {
            Self::create(config, BTreeMap::new())
        }
    }

    /// A store without a data file; nothing survives the process.
    pub fn in_memory(config: UniverseConfig) -> Self {
        let state = State::new(config.global_order);
        Self::assemble(config, state, None, None)
    }

    fn with_file(
        config: UniverseConfig,
        state: Arc<State>,
        file: AtomDataFile,
    ) -> Result<Self, UniverseError> {
        let hosted = file.hosted_reader()?;
        Ok(Self::assemble(config, state, Some(file), Some(hosted)))
    }

    fn assemble(
        config: UniverseConfig,
        state: Arc<State>,
        file: Option<AtomDataFile>,
        hosted: Option<HostedReader>,
    ) -> Self {
        Self {
            header: file.as_ref().map(|f| f.header().clone()),
            read_only: AtomicBool::new(config.read_only),
            default_indexing: AtomicBool::new(config.default_indexing),
            journal: Mutex::new(file),
            hosted: Mutex::new(hosted),
            state,
            config,
        }
    }

    /// Flushes the data file and closes the store.
    pub fn close(self) -> Result<(), UniverseError> {
        if let Some(file) = self.journal.lock().as_mut() {
            file.sync()?;
        }
        info!(path = %self.config.path.display(), ucn = self.state.ucn(), "closed universe");
        Ok(())
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    pub fn config(&self) -> &UniverseConfig {
        &self.config
    }

    /// The committed atom in slot `id`.
    pub fn get_atom(&self, id: u64) -> Option<Arc<Atom>> {
        self.state.get_atom(id)
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Expansion<'_> {
        Expansion::new(self)
    }

    /// Registers a new index. It fills itself on its first read.
    pub fn create_index(&self, info: IndexInfo) -> Result<Arc<Index>, UniverseError> {
        let index = self.state.add_index(info)?;
        if self.is_default_indexing() {
            index.update();
        }
        Ok(index)
    }

    /// Every index, the global one first.
    pub fn indices(&self) -> Vec<Arc<Index>> {
        self.state.indices()
    }

    pub fn index(&self, name: &str) -> Option<Arc<Index>> {
        self.state.index_by_name(name)
    }

    pub fn index_by_id(&self, id: u32) -> Option<Arc<Index>> {
        self.state.index_by_id(id)
    }

    /// The index over every committed atom.
    pub fn global_index(&self) -> Arc<Index> {
        Arc::clone(self.state.global_index())
    }

    pub fn is_default_indexing(&self) -> bool {
        self.default_indexing.load(Ordering::Acquire)
    }

    /// When enabled, every commit brings all indices up to date before it
    /// returns.
    pub fn set_default_indexing(&self, enabled: bool) {
        self.default_indexing.store(enabled, Ordering::Release);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Switches commits off or on. A store whose file was opened read-only
    /// cannot be made writable.
    pub fn set_read_only(&self, read_only: bool) -> Result<(), UniverseError> {
        if !read_only {
            if let Some(file) = self.journal.lock().as_ref() {
                if file.is_read_only() {
                    return Err(UniverseError::ReadOnly);
                }
            }
        }
        self.read_only.store(read_only, Ordering::Release);
        Ok(())
    }

    /// UCN the next commit will receive.
    pub fn ucn(&self) -> u64 {
        self.state.ucn()
    }

    pub fn atom_count(&self) -> usize {
        self.state.atom_count()
    }

    /// Payload of a bytes junction, read from the data file when it is
    /// file-hosted.
    ///
    /// Does not touch the commit mutex; safe to call from a verifier or a
    /// commit callback.
    pub fn read_bytes(&self, particle: &Particle) -> Result<Vec<u8>, UniverseError> {
        match particle {
            Particle::Bytes(b) => Ok(b.clone()),
            Particle::FileHostedBytes { offset, len } => {
                let mut hosted = self.hosted.lock();
                let reader = hosted.as_mut().ok_or(UniverseError::NoDataFile)?;
                Ok(reader.read_hosted(*offset, *len)?)
            }
            Particle::Integer(_) | Particle::IsoString(_) => Err(UniverseError::NotBytes),
        }
    }

    /// Random id fixed when the data file was created.
    pub fn store_id(&self) -> Option<String> {
        self.header.as_ref().map(|h| h.store_id.to_string())
    }

    pub fn format_version(&self) -> Option<u32> {
        self.header.as_ref().map(|h| h.version)
    }

    /// Metadata written when the data file was created.
    pub fn custom_metadata(&self) -> Option<&BTreeMap<String, String>> {
        self.header.as_ref().map(|h| &h.metadata)
    }
}

#[cfg(test)]
mod tests;
