use atomfile::AtomDataFileError;
use thiserror::Error;

/// Misuse of the store API, or a data file failure surfaced by it.
#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("store is read-only")]
    ReadOnly,

    #[error("slot {0} is not pending")]
    SlotNotPending(u64),

    #[error("atom {0} was not created by this expansion")]
    UnknownAtom(u64),

    #[error("particle does not hold bytes")]
    NotBytes,

    #[error("file-hosted payload requested from a store without a data file")]
    NoDataFile,

    #[error("an index named {0:?} already exists")]
    DuplicateIndex(String),

    #[error(transparent)]
    DataFile(#[from] AtomDataFileError),
}

/// Why a commit did not happen. The store is left exactly as it was before
/// the attempt.
#[derive(Debug, Error)]
pub enum CommitError {
    /// A verifier rejected the expansion.
    #[error("verification failed: {0:#}")]
    Verification(anyhow::Error),

    /// The record could not be written to the data file.
    #[error("commit could not be made durable")]
    Durability(#[source] AtomDataFileError),

    #[error("store is read-only")]
    ReadOnly,

    #[error(transparent)]
    State(#[from] UniverseError),
}
