//! The open data file: header handling, record appends and payload reads.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use atom::{AtomBuilder, AttrKey, Particle};
use byteorder::{LittleEndian, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use tracing::{debug, info, warn};

use crate::format::{
    record_format, write_varint, zigzag_encode, RecordFormat, ATOM_MARKER, CURRENT_VERSION,
    END_OF_ATOMS, END_OF_RECORD, EXPANSION_MARKER, PAD_BYTE, TAG_BYTES, TAG_FILE_HOSTED,
    TAG_INTEGER, TAG_STRING,
};
use crate::header::FileHeader;
use crate::reader::{intact_record_in, read_records, ExpansionRecord, ReadSummary};
use crate::AtomDataFileError;

/// Location of a payload written as file-hosted bytes by
/// [`AtomDataFile::append_expansion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostedRef {
    pub atom_id: u64,
    pub key: AttrKey,
    /// Absolute offset of the payload.
    pub offset: u64,
    pub len: u64,
}

impl HostedRef {
    pub fn particle(&self) -> Particle {
        Particle::FileHostedBytes {
            offset: self.offset,
            len: self.len,
        }
    }
}

/// An open atom data file.
///
/// Appends always go to the end of the last complete record. Every append is
/// written with a single `write_all`; when `sync` is set it is followed by
/// `sync_data` so the record is durable before the call returns.
pub struct AtomDataFile {
    file: File,
    path: PathBuf,
    header: FileHeader,
    header_len: u64,
    /// Offset where the next record will be written.
    end: u64,
    sync: bool,
    read_only: bool,
    /// Reusable encode buffer.
    buf: Vec<u8>,
}

impl std::fmt::Debug for AtomDataFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomDataFile")
            .field("path", &self.path)
            .field("store_id", &self.header.store_id)
            .field("version", &self.header.version)
            .field("end", &self.end)
            .field("sync", &self.sync)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl AtomDataFile {
    /// Creates a new file at `path` with the current format version.
    ///
    /// Fails with [`AtomDataFileError::AlreadyExists`] if the file exists.
    pub fn create<P: AsRef<Path>>(
        path: P,
        metadata: BTreeMap<String, String>,
        sync: bool,
    ) -> Result<Self, AtomDataFileError> {
        Self::create_with_version(path, metadata, CURRENT_VERSION, sync)
    }

    /// Creates a new file written in format `version`.
    pub fn create_with_version<P: AsRef<Path>>(
        path: P,
        metadata: BTreeMap<String, String>,
        version: u32,
        sync: bool,
    ) -> Result<Self, AtomDataFileError> {
        let path = path.as_ref().to_path_buf();
        let header = FileHeader::new(version, metadata);
        let bytes = header.encode()?;

        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(AtomDataFileError::AlreadyExists(path));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&bytes)?;
        file.sync_all()?;

        info!(path = %path.display(), store_id = %header.store_id, version, "created atom data file");
        Ok(Self {
            file,
            path,
            header,
            header_len: bytes.len() as u64,
            end: bytes.len() as u64,
            sync,
            read_only: false,
            buf: Vec::with_capacity(256),
        })
    }

    /// Opens an existing file and validates its header.
    ///
    /// Records are not read until [`read_all`](Self::read_all) is called.
    pub fn open<P: AsRef<Path>>(
        path: P,
        sync: bool,
        read_only: bool,
    ) -> Result<Self, AtomDataFileError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;
        let (header, header_len) = FileHeader::decode(&mut io::BufReader::new(&mut file))?;
        let end = file.seek(SeekFrom::End(0))?;

        Ok(Self {
            file,
            path,
            header,
            header_len,
            end,
            sync,
            read_only,
            buf: Vec::with_capacity(256),
        })
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset just past the last byte written.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end
    }

    /// `true` when the file holds no records yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end == self.header_len
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Replays every record in file order into `sink`.
    ///
    /// On success the append position is set just past the last record, so
    /// trailing padding is overwritten by the next append.
    pub fn read_all<F>(&mut self, sink: F) -> Result<ReadSummary, AtomDataFileError>
    where
        F: FnMut(ExpansionRecord) -> Result<(), AtomDataFileError>,
    {
        let format = record_format(self.header.version)?;
        self.file.seek(SeekFrom::Start(self.header_len))?;
        let summary = match read_records(&mut self.file, self.header_len, format, sink) {
            Err(AtomDataFileError::Truncated { offset }) => {
                return Err(self.classify_short_record(offset, format));
            }
            result => result?,
        };
        self.end = summary.end_offset;
        debug!(
            records = summary.records,
            atoms = summary.atoms,
            end = summary.end_offset,
            "replayed atom data file"
        );
        Ok(summary)
    }

    /// Decides whether the record at `offset`, which ran into EOF, is a torn
    /// tail or a damaged record with intact records after it.
    fn classify_short_record(&mut self, offset: u64, format: &RecordFormat) -> AtomDataFileError {
        let mut rest = Vec::new();
        let read = self
            .file
            .seek(SeekFrom::Start(offset + 1))
            .and_then(|_| self.file.read_to_end(&mut rest));
        if let Err(e) = read {
            return e.into();
        }
        match intact_record_in(&rest, offset + 1, format) {
            Some(next) => {
                warn!(offset, next, "record runs past EOF but an intact record follows");
                AtomDataFileError::corrupt(
                    offset,
                    format!("record runs past EOF but an intact record starts at {}", next),
                )
            }
            None => AtomDataFileError::Truncated { offset },
        }
    }

    /// Appends one expansion record for `atoms` committed under `ucn`.
    ///
    /// Byte values longer than `hosted_threshold` (0 disables hosting) are
    /// written as file-hosted payloads when the format supports it; their
    /// final locations are returned so callers can point the sealed atoms at
    /// them. File-hosted values coming from older atoms are copied into the
    /// new record.
    ///
    /// If the write fails the file is cut back to its previous length, so a
    /// failed append never leaves a partial record behind.
    pub fn append_expansion(
        &mut self,
        ucn: u64,
        atoms: &[AtomBuilder],
        hosted_threshold: u64,
    ) -> Result<Vec<HostedRef>, AtomDataFileError> {
        if self.read_only {
            return Err(AtomDataFileError::ReadOnly);
        }
        let hosting = hosted_threshold > 0 && record_format(self.header.version)?.file_hosted;

        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let mut hosted = Vec::new();
        let encoded = self.encode_record(&mut buf, ucn, atoms, hosting, hosted_threshold, &mut hosted);
        let result = encoded.and_then(|()| self.write_at_end(&buf));
        let record_start = self.end;
        let record_len = buf.len() as u64;
        self.buf = buf;
        result?;

        self.end = record_start + record_len;
        for h in &mut hosted {
            h.offset += record_start;
        }
        debug!(ucn, atoms = atoms.len(), bytes = record_len, "appended expansion record");
        Ok(hosted)
    }

    fn encode_record(
        &mut self,
        buf: &mut Vec<u8>,
        ucn: u64,
        atoms: &[AtomBuilder],
        hosting: bool,
        hosted_threshold: u64,
        hosted: &mut Vec<HostedRef>,
    ) -> Result<(), AtomDataFileError> {
        buf.push(EXPANSION_MARKER);
        write_varint(buf, ucn);

        for atom in atoms {
            buf.push(ATOM_MARKER);
            write_varint(buf, atom.id());
            for (key, value) in atom.junctions() {
                match value {
                    Particle::Integer(v) => {
                        buf.push(TAG_INTEGER);
                        write_varint(buf, *key);
                        write_varint(buf, zigzag_encode(*v));
                    }
                    Particle::IsoString(s) => {
                        buf.push(TAG_STRING);
                        write_varint(buf, *key);
                        write_varint(buf, s.len() as u64);
                        buf.extend_from_slice(s.as_bytes());
                    }
                    Particle::Bytes(b) => {
                        let host = hosting && b.len() as u64 > hosted_threshold;
                        push_bytes(buf, atom.id(), *key, b, host, hosted);
                    }
                    Particle::FileHostedBytes { offset, len } => {
                        let payload = self.read_hosted(*offset, *len)?;
                        push_bytes(buf, atom.id(), *key, &payload, hosting, hosted);
                    }
                }
            }
        }
        buf.push(END_OF_ATOMS);

        let mut hasher = Crc32::new();
        hasher.update(buf);
        buf.write_u32::<LittleEndian>(hasher.finalize())?;
        buf.push(END_OF_RECORD);
        Ok(())
    }

    fn write_at_end(&mut self, bytes: &[u8]) -> Result<(), AtomDataFileError> {
        let start = self.end;
        let written = self
            .file
            .seek(SeekFrom::Start(start))
            .and_then(|_| self.file.write_all(bytes))
            .and_then(|()| self.file.flush())
            .and_then(|()| if self.sync { self.file.sync_data() } else { Ok(()) });

        if let Err(e) = written {
            // best effort: drop whatever part of the record reached the file
            let _ = self.file.set_len(start);
            return Err(e.into());
        }
        Ok(())
    }

    /// Reads a file-hosted payload.
    pub fn read_hosted(&mut self, offset: u64, len: u64) -> Result<Vec<u8>, AtomDataFileError> {
        let in_bounds = offset
            .checked_add(len)
            .map_or(false, |end| offset >= self.header_len && end <= self.end);
        if !in_bounds {
            return Err(AtomDataFileError::corrupt(
                offset,
                format!("hosted payload of {} bytes lies outside the records", len),
            ));
        }
        let mut payload = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// A separate read handle for file-hosted payloads, usable without
    /// access to this file.
    pub fn hosted_reader(&self) -> Result<HostedReader, AtomDataFileError> {
        Ok(HostedReader {
            file: File::open(&self.path)?,
            header_len: self.header_len,
        })
    }

    /// Appends `count` pad bytes after the last record.
    pub fn pad(&mut self, count: usize) -> Result<(), AtomDataFileError> {
        if self.read_only {
            return Err(AtomDataFileError::ReadOnly);
        }
        self.write_at_end(&vec![PAD_BYTE; count])?;
        self.end += count as u64;
        Ok(())
    }

    /// Cuts the file at `offset`, dropping everything after it.
    pub fn truncate(&mut self, offset: u64) -> Result<(), AtomDataFileError> {
        if self.read_only {
            return Err(AtomDataFileError::ReadOnly);
        }
        if offset < self.header_len {
            return Err(AtomDataFileError::corrupt(offset, "cannot truncate into the header"));
        }
        self.file.set_len(offset)?;
        self.file.sync_all()?;
        self.end = offset;
        Ok(())
    }

    /// Forces written records to disk.
    pub fn sync(&mut self) -> Result<(), AtomDataFileError> {
        if !self.read_only {
            self.file.flush()?;
            self.file.sync_all()?;
        }
        Ok(())
    }
}

/// Read-only handle onto the payloads of an [`AtomDataFile`].
///
/// It has its own cursor, so payload reads never wait on appends.
#[derive(Debug)]
pub struct HostedReader {
    file: File,
    header_len: u64,
}

impl HostedReader {
    /// Reads a file-hosted payload.
    pub fn read_hosted(&mut self, offset: u64, len: u64) -> Result<Vec<u8>, AtomDataFileError> {
        let file_len = self.file.metadata()?.len();
        let in_bounds = offset
            .checked_add(len)
            .map_or(false, |end| offset >= self.header_len && end <= file_len);
        if !in_bounds {
            return Err(AtomDataFileError::corrupt(
                offset,
                format!("hosted payload of {} bytes lies outside the file", len),
            ));
        }
        let mut payload = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut payload)?;
        Ok(payload)
    }
}

fn push_bytes(
    buf: &mut Vec<u8>,
    atom_id: u64,
    key: AttrKey,
    payload: &[u8],
    host: bool,
    hosted: &mut Vec<HostedRef>,
) {
    buf.push(if host { TAG_FILE_HOSTED } else { TAG_BYTES });
    write_varint(buf, key);
    write_varint(buf, payload.len() as u64);
    if host {
        hosted.push(HostedRef {
            atom_id,
            key,
            offset: buf.len() as u64,
            len: payload.len() as u64,
        });
    }
    buf.extend_from_slice(payload);
}
