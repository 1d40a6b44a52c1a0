//! # AtomDataFile - durable log of committed expansions
//!
//! A store keeps every committed expansion (transaction) in one append-only
//! file. On open, the file is replayed record by record to rebuild the atom
//! table.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ HEADER                                                        │
//! │ magic "ATOMDATA" (8) | header_len (u32) | store_id (16)       │
//! │ version (u32) | meta_count (u32)                              │
//! │ meta_count × [key_len (u32) | key | val_len (u32) | val]      │
//! │ crc32 (u32) over magic .. last metadata byte                  │
//! ├───────────────────────────────────────────────────────────────┤
//! │ RECORD (one per committed expansion)                          │
//! │ 0xE5 | ucn (varint)                                           │
//! │   0xA1 | atom id (varint)                                     │
//! │     tag (u8) | key (varint) | value       ... per junction    │
//! │   ... per atom                                                │
//! │ 0xEA end of atoms                                             │
//! │ crc32 (u32) over 0xE5 .. 0xEA | 0xED end of record            │
//! ├───────────────────────────────────────────────────────────────┤
//! │ optional 0x00 padding, then the next record or EOF            │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Fixed-width integers are little-endian; varints are unsigned LEB128.
//! Junction values are tagged:
//!
//! | tag  | value                                   | since |
//! |------|-----------------------------------------|-------|
//! | 0x01 | integer, zigzag varint                  | v1    |
//! | 0x02 | string, varint length + UTF-8           | v1    |
//! | 0x03 | bytes, varint length + payload          | v1    |
//! | 0x04 | file-hosted bytes, varint length + payload, read lazily | v2 |
//!
//! File-hosted payloads are stored inside the record like inline bytes (and
//! covered by its CRC), but replay hands out only their offset and length.
//!
//! ## Recovery
//!
//! Replay accepts padding followed by EOF as a clean end. An EOF inside the
//! last record is reported as [`AtomDataFileError::Truncated`] with the offset
//! of the torn record. When an intact record still follows the one that ran
//! into EOF, a damaged length made it overrun, and the error is
//! [`AtomDataFileError::Corrupt`] instead. Every other parse failure (bad
//! marker, CRC mismatch, malformed varint) is [`AtomDataFileError::Corrupt`]
//! or [`AtomDataFileError::RecordCrcMismatch`]. Nothing is guessed.

mod file;
mod format;
mod header;
mod reader;

pub use file::{AtomDataFile, HostedReader, HostedRef};
pub use format::{
    record_format, RecordFormat, CURRENT_VERSION, MAX_SUPPORTED_VERSION, MIN_SUPPORTED_VERSION,
    PAD_BYTE,
};
pub use header::FileHeader;
pub use reader::{read_records, ExpansionRecord, ReadSummary};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading or writing an atom data file.
///
/// Any of these makes the affected file unusable; the store refuses to open
/// on them.
#[derive(Debug, Error)]
pub enum AtomDataFileError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("not an atom data file (bad magic)")]
    BadMagic,

    #[error("unsupported format version {version} (supported {min}..={max})")]
    UnsupportedVersion { version: u32, min: u32, max: u32 },

    #[error("header checksum mismatch")]
    HeaderCrcMismatch,

    #[error("corrupt header: {0}")]
    CorruptHeader(String),

    #[error("checksum mismatch in record at offset {offset}")]
    RecordCrcMismatch { offset: u64 },

    #[error("corrupt record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("record at offset {offset} is truncated")]
    Truncated { offset: u64 },

    #[error("record at offset {offset} has UCN {ucn}, expected at least {expected}")]
    UcnOutOfOrder { offset: u64, ucn: u64, expected: u64 },

    #[error("atom {id} stored twice (record at offset {offset})")]
    DuplicateAtom { id: u64, offset: u64 },

    #[error("file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("file was opened read-only")]
    ReadOnly,
}

impl AtomDataFileError {
    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        AtomDataFileError::Corrupt {
            offset,
            reason: reason.into(),
        }
    }
}
