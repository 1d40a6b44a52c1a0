//! File header: signature, store identity, format version and the custom
//! metadata written once at creation.

use std::collections::BTreeMap;
use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use uuid::Uuid;

use crate::format::{record_format, MAGIC, MAX_HEADER_LEN};
use crate::AtomDataFileError;

/// magic (8) + header_len (4) + store_id (16) + version (4) + meta_count (4) + crc (4)
const MIN_HEADER_LEN: u32 = 8 + 4 + 16 + 4 + 4 + 4;

/// Parsed file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Random identifier fixed when the file is created.
    pub store_id: Uuid,
    pub version: u32,
    /// Caller-supplied string metadata, persisted only at creation.
    pub metadata: BTreeMap<String, String>,
}

impl FileHeader {
    /// A header for a brand-new store with a fresh identifier.
    pub fn new(version: u32, metadata: BTreeMap<String, String>) -> Self {
        Self {
            store_id: Uuid::new_v4(),
            version,
            metadata,
        }
    }

    /// Serializes the header, CRC included.
    pub fn encode(&self) -> Result<Vec<u8>, AtomDataFileError> {
        record_format(self.version)?;

        let mut buf = Vec::with_capacity(MIN_HEADER_LEN as usize);
        buf.extend_from_slice(&MAGIC);
        buf.write_u32::<LittleEndian>(0)?; // header_len, patched below
        buf.extend_from_slice(self.store_id.as_bytes());
        buf.write_u32::<LittleEndian>(self.version)?;
        buf.write_u32::<LittleEndian>(self.metadata.len() as u32)?;
        for (k, v) in &self.metadata {
            buf.write_u32::<LittleEndian>(k.len() as u32)?;
            buf.extend_from_slice(k.as_bytes());
            buf.write_u32::<LittleEndian>(v.len() as u32)?;
            buf.extend_from_slice(v.as_bytes());
        }

        let total = buf.len() + 4;
        if total > MAX_HEADER_LEN as usize {
            return Err(AtomDataFileError::CorruptHeader(format!(
                "header too large: {} bytes",
                total
            )));
        }
        buf[8..12].copy_from_slice(&(total as u32).to_le_bytes());

        let mut hasher = Crc32::new();
        hasher.update(&buf);
        buf.write_u32::<LittleEndian>(hasher.finalize())?;
        Ok(buf)
    }

    /// Reads and validates a header from the start of `r`.
    ///
    /// Returns the header together with its encoded length, which is the
    /// offset of the first record.
    pub fn decode<R: Read>(r: &mut R) -> Result<(Self, u64), AtomDataFileError> {
        let mut magic = [0u8; 8];
        read_or_bad_magic(r, &mut magic)?;
        if magic != MAGIC {
            return Err(AtomDataFileError::BadMagic);
        }

        let header_len = r.read_u32::<LittleEndian>()?;
        if !(MIN_HEADER_LEN..=MAX_HEADER_LEN).contains(&header_len) {
            return Err(AtomDataFileError::CorruptHeader(format!(
                "implausible header length {}",
                header_len
            )));
        }

        let mut rest = vec![0u8; header_len as usize - 12];
        r.read_exact(&mut rest)?;

        let (body, crc_bytes) = rest.split_at(rest.len() - 4);
        let mut hasher = Crc32::new();
        hasher.update(&magic);
        hasher.update(&header_len.to_le_bytes());
        hasher.update(body);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if hasher.finalize() != stored {
            return Err(AtomDataFileError::HeaderCrcMismatch);
        }

        let mut br = body;
        let mut id = [0u8; 16];
        br.read_exact(&mut id)?;
        let version = br.read_u32::<LittleEndian>()?;
        record_format(version)?;

        let count = br.read_u32::<LittleEndian>()?;
        let mut metadata = BTreeMap::new();
        for _ in 0..count {
            let key = read_string(&mut br)?;
            let value = read_string(&mut br)?;
            metadata.insert(key, value);
        }
        if !br.is_empty() {
            return Err(AtomDataFileError::CorruptHeader(format!(
                "{} unexpected bytes after metadata",
                br.len()
            )));
        }

        Ok((
            Self {
                store_id: Uuid::from_bytes(id),
                version,
                metadata,
            },
            u64::from(header_len),
        ))
    }
}

fn read_or_bad_magic<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), AtomDataFileError> {
    match r.read_exact(buf) {
        Ok(()) => Ok(()),
        // a file shorter than the signature is not an atom data file
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(AtomDataFileError::BadMagic)
        }
        Err(e) => Err(e.into()),
    }
}

fn read_string(br: &mut &[u8]) -> Result<String, AtomDataFileError> {
    let len = br.read_u32::<LittleEndian>()? as usize;
    if len > br.len() {
        return Err(AtomDataFileError::CorruptHeader(
            "metadata entry runs past the header".into(),
        ));
    }
    let (s, rest) = br.split_at(len);
    *br = rest;
    String::from_utf8(s.to_vec())
        .map_err(|_| AtomDataFileError::CorruptHeader("metadata is not UTF-8".into()))
}
