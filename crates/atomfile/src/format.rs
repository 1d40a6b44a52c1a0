//! Format constants, varint helpers and the version table.
//!
//! Every supported format version maps to a [`RecordFormat`] describing which
//! value tags its records may contain. Versions outside the table are
//! rejected when the header is loaded.

use std::io;

use crate::AtomDataFileError;

/// File signature, ASCII "ATOMDATA".
pub const MAGIC: [u8; 8] = *b"ATOMDATA";

/// Format version written by new files.
pub const CURRENT_VERSION: u32 = 2;
pub const MIN_SUPPORTED_VERSION: u32 = 1;
pub const MAX_SUPPORTED_VERSION: u32 = 2;

/// Filler byte allowed between records and before EOF.
pub const PAD_BYTE: u8 = 0x00;

pub(crate) const EXPANSION_MARKER: u8 = 0xE5;
pub(crate) const ATOM_MARKER: u8 = 0xA1;
pub(crate) const END_OF_ATOMS: u8 = 0xEA;
pub(crate) const END_OF_RECORD: u8 = 0xED;

pub(crate) const TAG_INTEGER: u8 = 0x01;
pub(crate) const TAG_STRING: u8 = 0x02;
pub(crate) const TAG_BYTES: u8 = 0x03;
pub(crate) const TAG_FILE_HOSTED: u8 = 0x04;

/// Upper bound for a single string or byte payload (256 MiB).
pub(crate) const MAX_VALUE_LEN: u64 = 256 * 1024 * 1024;

/// Upper bound for the header, metadata included (16 MiB).
pub(crate) const MAX_HEADER_LEN: u32 = 16 * 1024 * 1024;

/// Kind of junction value announced by a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueKind {
    Integer,
    String,
    Bytes,
    FileHosted,
}

/// Decoding rules for one format version.
#[derive(Debug)]
pub struct RecordFormat {
    pub version: u32,
    /// Whether large byte values may be stored as file-hosted.
    pub file_hosted: bool,
    value_kind: fn(u8) -> Option<ValueKind>,
}

impl RecordFormat {
    pub(crate) fn value_kind(&self, tag: u8) -> Option<ValueKind> {
        (self.value_kind)(tag)
    }
}

fn v1_value_kind(tag: u8) -> Option<ValueKind> {
    match tag {
        TAG_INTEGER => Some(ValueKind::Integer),
        TAG_STRING => Some(ValueKind::String),
        TAG_BYTES => Some(ValueKind::Bytes),
        _ => None,
    }
}

fn v2_value_kind(tag: u8) -> Option<ValueKind> {
    match tag {
        TAG_FILE_HOSTED => Some(ValueKind::FileHosted),
        other => v1_value_kind(other),
    }
}

static FORMATS: [RecordFormat; 2] = [
    RecordFormat {
        version: 1,
        file_hosted: false,
        value_kind: v1_value_kind,
    },
    RecordFormat {
        version: 2,
        file_hosted: true,
        value_kind: v2_value_kind,
    },
];

/// Looks up the decoding rules for `version`.
pub fn record_format(version: u32) -> Result<&'static RecordFormat, AtomDataFileError> {
    FORMATS
        .iter()
        .find(|f| f.version == version)
        .ok_or(AtomDataFileError::UnsupportedVersion {
            version,
            min: MIN_SUPPORTED_VERSION,
            max: MAX_SUPPORTED_VERSION,
        })
}

/// Appends `v` as unsigned LEB128.
pub(crate) fn write_varint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Decodes an unsigned LEB128 value, pulling bytes from `next`.
pub(crate) fn read_varint<F>(mut next: F) -> io::Result<u64>
where
    F: FnMut() -> io::Result<u8>,
{
    let mut value = 0u64;
    for i in 0..10 {
        let byte = next()?;
        let bits = u64::from(byte & 0x7f);
        if i == 9 && byte > 1 {
            break;
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflows u64"))
}

pub(crate) fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub(crate) fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> io::Result<u64> {
        let mut it = bytes.iter();
        read_varint(|| {
            it.next()
                .copied()
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
        })
    }

    #[test]
    fn varint_edges() {
        for v in [0, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            assert_eq!(decode(&buf).unwrap(), v);
        }
        let mut buf = Vec::new();
        write_varint(&mut buf, 127);
        assert_eq!(buf, vec![0x7f]);
    }

    #[test]
    fn varint_rejects_overlong_input() {
        let err = decode(&[0xff; 11]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err = decode(&[0x80]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn zigzag_keeps_small_magnitudes_small() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        for v in [i64::MIN, -42, 0, 42, i64::MAX] {
            assert_eq!(zigzag_decode(zigzag_encode(v)), v);
        }
    }

    #[test]
    fn version_table_rejects_unknown_versions() {
        assert!(!record_format(1).unwrap().file_hosted);
        assert!(record_format(2).unwrap().file_hosted);
        assert_eq!(record_format(1).unwrap().value_kind(TAG_FILE_HOSTED), None);
        assert!(matches!(
            record_format(3),
            Err(AtomDataFileError::UnsupportedVersion { version: 3, .. })
        ));
        assert!(record_format(0).is_err());
    }
}
