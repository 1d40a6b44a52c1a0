//! # Atom - the unit of storage
//!
//! An [`Atom`] is an immutable record made of **junctions**: associations from
//! an [`AttrKey`] to a [`Particle`]. Every atom lives in a numbered slot of the
//! store's atom table (its `id`) and carries the UCN (universal change number)
//! of the commit that made it visible.
//!
//! Atoms are built through an [`AtomBuilder`] while their slot is still
//! pending. Sealing consumes the builder and produces the immutable [`Atom`],
//! so an atom cannot be sealed twice and cannot change after it was sealed.
//! Sealed atoms are plain data and are shared across threads as `Arc<Atom>`.
//!
//! ## Example
//!
//! ```rust
//! use atom::{AtomBuilder, Particle};
//!
//! let mut b = AtomBuilder::new(7);
//! b.add_junction(1, "summary");
//! b.add_junction(2, 42i64);
//! let atom = b.seal(3);
//!
//! assert_eq!(atom.id(), 7);
//! assert_eq!(atom.ucn(), 3);
//! assert_eq!(atom.value(2), Some(&Particle::Integer(42)));
//! ```

use std::collections::BTreeMap;
use std::fmt;

/// Key of a junction. Keys are opaque numbers chosen by the caller.
pub type AttrKey = u64;

/// UCN value of an atom that has not been committed.
pub const UNSET_UCN: u64 = 0;

/// A tagged immutable value held by a junction.
///
/// Ordering and equality are defined per variant; values of different
/// variants order by variant (integers first, file-hosted bytes last).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Particle {
    /// A signed 64-bit integer.
    Integer(i64),
    /// A UTF-8 string.
    IsoString(String),
    /// A byte buffer owned by the atom.
    Bytes(Vec<u8>),
    /// A byte range stored inside the atom data file. The payload is read on
    /// demand instead of being kept in memory.
    FileHostedBytes {
        /// Absolute offset of the first payload byte in the data file.
        offset: u64,
        /// Payload length in bytes.
        len: u64,
    },
}

impl Particle {
    /// Returns the integer value, if this is an [`Particle::Integer`].
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Particle::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string value, if this is an [`Particle::IsoString`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Particle::IsoString(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the in-memory bytes, if this is a [`Particle::Bytes`].
    ///
    /// File-hosted bytes return `None`; read them through the store.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Particle::Bytes(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_file_hosted(&self) -> bool {
        matches!(self, Particle::FileHostedBytes { .. })
    }

    /// Length of the byte payload for both byte variants.
    #[must_use]
    pub fn byte_len(&self) -> Option<u64> {
        match self {
            Particle::Bytes(b) => Some(b.len() as u64),
            Particle::FileHostedBytes { len, .. } => Some(*len),
            _ => None,
        }
    }
}

impl From<i64> for Particle {
    fn from(v: i64) -> Self {
        Particle::Integer(v)
    }
}

impl From<&str> for Particle {
    fn from(v: &str) -> Self {
        Particle::IsoString(v.to_string())
    }
}

impl From<String> for Particle {
    fn from(v: String) -> Self {
        Particle::IsoString(v)
    }
}

impl From<Vec<u8>> for Particle {
    fn from(v: Vec<u8>) -> Self {
        Particle::Bytes(v)
    }
}

impl From<&[u8]> for Particle {
    fn from(v: &[u8]) -> Self {
        Particle::Bytes(v.to_vec())
    }
}

impl fmt::Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Particle::Integer(v) => write!(f, "{}", v),
            Particle::IsoString(s) => write!(f, "{:?}", s),
            Particle::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Particle::FileHostedBytes { offset, len } => {
                write!(f, "<{} bytes @{}>", len, offset)
            }
        }
    }
}

/// Read access to a junction map.
///
/// Implemented by both sealed atoms and builders, so index lookups can take
/// either a stored atom or a sample built on the fly.
pub trait Junctions {
    /// Returns the value bound to `key`, if any.
    fn value(&self, key: AttrKey) -> Option<&Particle>;
}

/// Mutable build handle for an atom whose slot is still pending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomBuilder {
    id: u64,
    junctions: BTreeMap<AttrKey, Particle>,
}

impl AtomBuilder {
    /// Starts building the atom stored in slot `id`.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            junctions: BTreeMap::new(),
        }
    }

    /// Starts building from an already decoded junction map.
    pub fn from_junctions(id: u64, junctions: BTreeMap<AttrKey, Particle>) -> Self {
        Self { id, junctions }
    }

    /// A builder not bound to any slot, used as a search sample.
    pub fn sample() -> Self {
        Self::new(0)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Binds `key` to `value`, returning the value it replaces.
    pub fn add_junction(&mut self, key: AttrKey, value: impl Into<Particle>) -> Option<Particle> {
        self.junctions.insert(key, value.into())
    }

    /// Builder-style variant of [`add_junction`](Self::add_junction).
    #[must_use]
    pub fn with(mut self, key: AttrKey, value: impl Into<Particle>) -> Self {
        self.add_junction(key, value);
        self
    }

    pub fn remove_junction(&mut self, key: AttrKey) -> Option<Particle> {
        self.junctions.remove(&key)
    }

    pub fn junctions(&self) -> &BTreeMap<AttrKey, Particle> {
        &self.junctions
    }

    pub fn len(&self) -> usize {
        self.junctions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.junctions.is_empty()
    }

    /// Seals the atom with the UCN of the commit that publishes it.
    ///
    /// # Panics
    ///
    /// Panics if `ucn` is [`UNSET_UCN`]; a committed atom always has a UCN.
    pub fn seal(self, ucn: u64) -> Atom {
        assert!(ucn != UNSET_UCN, "atom {} sealed without a UCN", self.id);
        Atom {
            id: self.id,
            ucn,
            junctions: self.junctions,
        }
    }
}

impl Junctions for AtomBuilder {
    fn value(&self, key: AttrKey) -> Option<&Particle> {
        self.junctions.get(&key)
    }
}

/// A sealed, immutable atom.
///
/// Equality and hashing look only at the junctions; two atoms in different
/// slots with the same junctions compare equal. Use
/// [`same_version`](Atom::same_version) to also compare slot and UCN.
#[derive(Debug, Clone)]
pub struct Atom {
    id: u64,
    ucn: u64,
    junctions: BTreeMap<AttrKey, Particle>,
}

impl Atom {
    /// Slot number of this atom in the atom table.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// UCN of the commit that published this atom.
    #[must_use]
    pub fn ucn(&self) -> u64 {
        self.ucn
    }

    pub fn value(&self, key: AttrKey) -> Option<&Particle> {
        self.junctions.get(&key)
    }

    pub fn junctions(&self) -> &BTreeMap<AttrKey, Particle> {
        &self.junctions
    }

    pub fn iter(&self) -> impl Iterator<Item = (AttrKey, &Particle)> {
        self.junctions.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.junctions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.junctions.is_empty()
    }

    /// Full identity: same slot, same UCN and same junctions.
    #[must_use]
    pub fn same_version(&self, other: &Atom) -> bool {
        self.id == other.id && self.ucn == other.ucn && self.junctions == other.junctions
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        self.junctions == other.junctions
    }
}

impl Eq for Atom {}

impl std::hash::Hash for Atom {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.junctions.hash(state);
    }
}

impl Junctions for Atom {
    fn value(&self, key: AttrKey) -> Option<&Particle> {
        self.junctions.get(&key)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{} {{", self.id, self.ucn)?;
        for (i, (k, v)) in self.junctions.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        write!(f, "}}")
    }
}
