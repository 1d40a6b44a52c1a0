//! Sequential record reader used by replay.
//!
//! The reader is generic over any `Read` implementor so tests can feed it
//! in-memory buffers. It tracks the absolute file offset of every byte it
//! consumes, which is how file-hosted payloads get their offsets.

use std::collections::BTreeMap;
use std::io::{self, BufReader, Read};

use atom::{Atom, AtomBuilder, AttrKey, Particle};
use crc32fast::Hasher as Crc32;

use crate::format::{
    read_varint, zigzag_decode, RecordFormat, ValueKind, ATOM_MARKER, END_OF_ATOMS,
    END_OF_RECORD, EXPANSION_MARKER, MAX_VALUE_LEN, PAD_BYTE,
};
use crate::AtomDataFileError;

/// One committed expansion as read back from the file.
#[derive(Debug, Clone)]
pub struct ExpansionRecord {
    /// Offset of the record's first byte.
    pub offset: u64,
    pub ucn: u64,
    /// Atoms in the order they were written, sealed with `ucn`.
    pub atoms: Vec<Atom>,
}

/// Totals reported after a successful replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadSummary {
    pub records: u64,
    pub atoms: u64,
    /// Offset just past the last complete record.
    pub end_offset: u64,
}

/// Reads every record from `reader`, which must be positioned at absolute
/// file offset `start`, and hands each one to `sink` in file order.
///
/// Stops cleanly at EOF or at a run of [`PAD_BYTE`]s followed by EOF. The
/// first error from parsing or from `sink` aborts the replay.
pub fn read_records<R, F>(
    reader: R,
    start: u64,
    format: &RecordFormat,
    mut sink: F,
) -> Result<ReadSummary, AtomDataFileError>
where
    R: Read,
    F: FnMut(ExpansionRecord) -> Result<(), AtomDataFileError>,
{
    let mut stream = RecordStream::new(reader, start);
    let mut summary = ReadSummary {
        end_offset: start,
        ..ReadSummary::default()
    };

    loop {
        let offset = stream.pos;
        let marker = match stream.next_byte()? {
            None => return Ok(summary),
            Some(PAD_BYTE) => continue,
            Some(b) => b,
        };
        if marker != EXPANSION_MARKER {
            return Err(AtomDataFileError::corrupt(
                offset,
                format!("expected expansion marker, found {:#04x}", marker),
            ));
        }

        let record = stream
            .read_record(offset, format)
            .map_err(|e| e.at(offset))?;
        summary.records += 1;
        summary.atoms += record.atoms.len() as u64;
        summary.end_offset = stream.pos;
        sink(record)?;
    }
}

/// Offset of the first intact record that starts inside `data`, whose first
/// byte sits at absolute offset `base`.
///
/// A record cut short by EOF is a torn tail only when nothing after it
/// decodes; an intact record further on means bytes in between were damaged.
pub(crate) fn intact_record_in(data: &[u8], base: u64, format: &RecordFormat) -> Option<u64> {
    (0..data.len())
        .filter(|&i| data[i] == EXPANSION_MARKER)
        .find(|&i| {
            let offset = base + i as u64;
            RecordStream::new(&data[i + 1..], offset + 1)
                .read_record(offset, format)
                .is_ok()
        })
        .map(|i| base + i as u64)
}

/// Parse failure inside a record, before the record offset is attached.
enum RecordError {
    Eof,
    Invalid(String),
    Crc,
    Io(io::Error),
}

impl RecordError {
    fn at(self, offset: u64) -> AtomDataFileError {
        match self {
            RecordError::Eof => AtomDataFileError::Truncated { offset },
            RecordError::Invalid(reason) => AtomDataFileError::corrupt(offset, reason),
            RecordError::Crc => AtomDataFileError::RecordCrcMismatch { offset },
            RecordError::Io(e) => AtomDataFileError::Io(e),
        }
    }
}

impl From<io::Error> for RecordError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => RecordError::Eof,
            io::ErrorKind::InvalidData => RecordError::Invalid(e.to_string()),
            _ => RecordError::Io(e),
        }
    }
}

struct RecordStream<R> {
    inner: BufReader<R>,
    pos: u64,
    crc: Crc32,
}

impl<R: Read> RecordStream<R> {
    fn new(reader: R, start: u64) -> Self {
        Self {
            inner: BufReader::new(reader),
            pos: start,
            crc: Crc32::new(),
        }
    }

    /// Reads one byte outside of any record; `None` at EOF.
    fn next_byte(&mut self) -> Result<Option<u8>, AtomDataFileError> {
        let mut b = [0u8; 1];
        loop {
            match self.inner.read(&mut b) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.pos += 1;
                    return Ok(Some(b[0]));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn u8(&mut self) -> Result<u8, RecordError> {
        let mut b = [0u8; 1];
        self.inner.read_exact(&mut b)?;
        self.pos += 1;
        self.crc.update(&b);
        Ok(b[0])
    }

    fn varint(&mut self) -> Result<u64, RecordError> {
        let mut err = None;
        let value = read_varint(|| {
            self.u8().map_err(|e| {
                let kind = match e {
                    RecordError::Eof => io::ErrorKind::UnexpectedEof,
                    _ => io::ErrorKind::Other,
                };
                err = Some(e);
                io::Error::from(kind)
            })
        });
        match (value, err) {
            (Ok(v), _) => Ok(v),
            (Err(_), Some(e)) => Err(e),
            (Err(e), None) => Err(e.into()),
        }
    }

    fn length(&mut self) -> Result<u64, RecordError> {
        let len = self.varint()?;
        if len > MAX_VALUE_LEN {
            return Err(RecordError::Invalid(format!("value length {} too large", len)));
        }
        Ok(len)
    }

    fn bytes(&mut self, len: u64) -> Result<Vec<u8>, RecordError> {
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf)?;
        self.pos += len;
        self.crc.update(&buf);
        Ok(buf)
    }

    /// Consumes `len` payload bytes into the CRC without keeping them.
    fn skip(&mut self, mut len: u64) -> Result<(), RecordError> {
        let mut chunk = [0u8; 8192];
        while len > 0 {
            let n = len.min(chunk.len() as u64) as usize;
            self.inner.read_exact(&mut chunk[..n])?;
            self.crc.update(&chunk[..n]);
            self.pos += n as u64;
            len -= n as u64;
        }
        Ok(())
    }

    fn read_record(
        &mut self,
        offset: u64,
        format: &RecordFormat,
    ) -> Result<ExpansionRecord, RecordError> {
        self.crc = Crc32::new();
        self.crc.update(&[EXPANSION_MARKER]);

        let ucn = self.varint()?;
        if ucn == 0 {
            return Err(RecordError::Invalid("record without a UCN".into()));
        }

        let mut builders: Vec<AtomBuilder> = Vec::new();
        let mut current: Option<(u64, BTreeMap<AttrKey, Particle>)> = None;

        loop {
            let b = self.u8()?;
            match b {
                ATOM_MARKER => {
                    if let Some((id, junctions)) = current.take() {
                        builders.push(AtomBuilder::from_junctions(id, junctions));
                    }
                    let id = self.varint()?;
                    current = Some((id, BTreeMap::new()));
                }
                END_OF_ATOMS => {
                    if let Some((id, junctions)) = current.take() {
                        builders.push(AtomBuilder::from_junctions(id, junctions));
                    }
                    break;
                }
                tag => {
                    let kind = format.value_kind(tag).ok_or_else(|| {
                        RecordError::Invalid(format!(
                            "unknown value tag {:#04x} for format v{}",
                            tag, format.version
                        ))
                    })?;
                    let Some((_, junctions)) = current.as_mut() else {
                        return Err(RecordError::Invalid("junction outside of an atom".into()));
                    };
                    let key = self.varint()?;
                    let value = self.value(kind)?;
                    if junctions.insert(key, value).is_some() {
                        return Err(RecordError::Invalid(format!("junction key {} repeated", key)));
                    }
                }
            }
        }

        let expected = self.crc.clone().finalize();
        let mut crc_bytes = [0u8; 4];
        self.inner.read_exact(&mut crc_bytes)?;
        self.pos += 4;
        let mut end = [0u8; 1];
        self.inner.read_exact(&mut end)?;
        self.pos += 1;

        if u32::from_le_bytes(crc_bytes) != expected {
            return Err(RecordError::Crc);
        }
        if end[0] != END_OF_RECORD {
            return Err(RecordError::Invalid(format!(
                "expected end-of-record marker, found {:#04x}",
                end[0]
            )));
        }

        Ok(ExpansionRecord {
            offset,
            ucn,
            atoms: builders.into_iter().map(|b| b.seal(ucn)).collect(),
        })
    }

    fn value(&mut self, kind: ValueKind) -> Result<Particle, RecordError> {
        Ok(match kind {
            ValueKind::Integer => Particle::Integer(zigzag_decode(self.varint()?)),
            ValueKind::String => {
                let len = self.length()?;
                let raw = self.bytes(len)?;
                let s = String::from_utf8(raw)
                    .map_err(|_| RecordError::Invalid("string value is not UTF-8".into()))?;
                Particle::IsoString(s)
            }
            ValueKind::Bytes => {
                let len = self.length()?;
                Particle::Bytes(self.bytes(len)?)
            }
            ValueKind::FileHosted => {
                let len = self.length()?;
                let offset = self.pos;
                self.skip(len)?;
                Particle::FileHostedBytes { offset, len }
            }
        })
    }
}
