//! Reading of `.DBF` tables: header, field descriptors, checksum snapshots,
//! and lazy record streaming.
//!
//! Structure of a `.DBF` file:
//! - 32-byte fixed header (type tag, record/header lengths, record count).
//! - Field descriptor array (32 bytes each), terminated by `0x0D`.
//! - Fixed-length record array: each record is `record_length` bytes, the
//!   first byte being the deletion flag, the remainder being field data in
//!   descriptor order.
//!
//! Used by `sync::engine` to detect and apply changes; never mutates the
//! file it reads.

use crate::core::memo::{MemoKind, MemoReader};
use crate::core::{DomainRow, FieldValue};
use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use encoding_rs::WINDOWS_1252;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Record index -> CRC-32 of that record's raw bytes, for all records
/// physically present in the file.
pub type ChecksumMap = BTreeMap<u32, u32>;

#[derive(Debug, Error)]
pub enum DbfReadError {
    #[error("cannot open DBF file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("truncated header or field descriptor array in {path}")]
    TruncatedHeader { path: PathBuf },
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("memo sidecar ({kind:?}) required but missing next to {path}")]
    MissingMemoSidecar { path: PathBuf, kind: MemoKind },
    #[error("record index {index} out of bounds ({count} records in file)")]
    IndexOutOfBounds { index: u32, count: u32 },
}

pub type Result<T> = std::result::Result<T, DbfReadError>;

/// xBase field type tags. `Other` keeps unrecognized codes around instead
/// of failing the whole table — a handful of FoxPro-specific codes (`Y`
/// currency, `T` datetime, `B` double, `G` general) show up in the wild and
/// are decoded as best-effort text rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Character,
    Numeric,
    Float,
    Logical,
    Date,
    Memo,
    Other(u8),
}

impl FieldKind {
    fn from_byte(b: u8) -> Self {
        match b {
            b'C' => FieldKind::Character,
            b'N' => FieldKind::Numeric,
            b'F' => FieldKind::Float,
            b'L' => FieldKind::Logical,
            b'D' => FieldKind::Date,
            b'M' => FieldKind::Memo,
            other => FieldKind::Other(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub length: u8,
    pub decimal_count: u8,
    /// Byte offset within the record, counting the leading deletion-flag byte.
    pub offset: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct DbfHeader {
    pub db_type: u8,
    pub num_records: u32,
    pub header_length: u16,
    pub record_length: u16,
}

impl DbfHeader {
    /// Memo sidecar implied by the header type tag alone (spec'd set of
    /// `0x83`/`0x8B` -> DBT, `0xF5`/`0x30` -> FPT).
    pub fn memo_kind_from_type(&self) -> Option<MemoKind> {
        match self.db_type {
            0x83 | 0x8B => Some(MemoKind::Dbt),
            0xF5 | 0x30 => Some(MemoKind::Fpt),
            _ => None,
        }
    }
}

pub struct DbfReader {
    path: PathBuf,
    header: DbfHeader,
    fields: Vec<FieldDescriptor>,
    requires_memo: bool,
    memo_kind: Option<MemoKind>,
    memo_path: Option<PathBuf>,
}

impl DbfReader {
    /// Opens a `.DBF` file, decoding its header and field descriptors. Does
    /// not read any record data.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|source| DbfReadError::Open {
            path: path.clone(),
            source,
        })?;

        let header = Self::read_header(&mut file, &path)?;
        let fields = Self::read_field_descriptors(&mut file, &path)?;

        let mut memo_kind = header.memo_kind_from_type();
        let has_memo_field = fields.iter().any(|f| f.kind == FieldKind::Memo);
        let requires_memo = memo_kind.is_some() || has_memo_field;
        if requires_memo && memo_kind.is_none() {
            // A memo field with no recognized header tag: FoxPro's FPT is
            // the more common modern case.
            memo_kind = Some(MemoKind::Fpt);
        }

        let memo_path = memo_kind.and_then(|kind| Self::locate_sidecar(&path, kind));
        if requires_memo && memo_path.is_none() {
            return Err(DbfReadError::MissingMemoSidecar {
                path,
                kind: memo_kind.unwrap(),
            });
        }

        Ok(Self {
            path,
            header,
            fields,
            requires_memo,
            memo_kind,
            memo_path,
        })
    }

    fn locate_sidecar(dbf_path: &Path, kind: MemoKind) -> Option<PathBuf> {
        let stem = dbf_path.file_stem()?.to_string_lossy().to_string();
        let dir = dbf_path.parent().unwrap_or_else(|| Path::new("."));
        for ext in kind.extensions() {
            let candidate = dir.join(format!("{stem}.{ext}"));
            if candidate.exists() {
                return Some(candidate);
            }
            let candidate = dir.join(format!("{stem}.{}", ext.to_uppercase()));
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    fn read_header<R: Read + Seek>(reader: &mut R, path: &Path) -> Result<DbfHeader> {
        reader
            .seek(SeekFrom::Start(0))
            .map_err(|source| DbfReadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let mut buf = [0u8; 32];
        reader
            .read_exact(&mut buf)
            .map_err(|_| DbfReadError::TruncatedHeader {
                path: path.to_path_buf(),
            })?;

        Ok(DbfHeader {
            db_type: buf[0],
            num_records: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            header_length: u16::from_le_bytes([buf[8], buf[9]]),
            record_length: u16::from_le_bytes([buf[10], buf[11]]),
        })
    }

    fn read_field_descriptors<R: Read + Seek>(
        reader: &mut R,
        path: &Path,
    ) -> Result<Vec<FieldDescriptor>> {
        reader
            .seek(SeekFrom::Start(32))
            .map_err(|source| DbfReadError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let mut fields = Vec::new();
        let mut offset = 1usize; // field data starts after the deletion-flag byte
        loop {
            let mut marker = [0u8; 1];
            reader
                .read_exact(&mut marker)
                .map_err(|_| DbfReadError::TruncatedHeader {
                    path: path.to_path_buf(),
                })?;
            if marker[0] == 0x0D {
                break;
            }

            let mut rest = [0u8; 31];
            reader
                .read_exact(&mut rest)
                .map_err(|_| DbfReadError::TruncatedHeader {
                    path: path.to_path_buf(),
                })?;

            let mut name_bytes = Vec::with_capacity(11);
            name_bytes.push(marker[0]);
            name_bytes.extend_from_slice(&rest[0..10]);
            let name_end = name_bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(name_bytes.len());
            let name = String::from_utf8_lossy(&name_bytes[..name_end])
                .trim()
                .to_uppercase();

            let kind = FieldKind::from_byte(rest[10]);
            let length = rest[15];
            let decimal_count = rest[16];

            fields.push(FieldDescriptor {
                name,
                kind,
                length,
                decimal_count,
                offset,
            });
            offset += length as usize;
        }

        if fields.is_empty() {
            return Err(DbfReadError::TruncatedHeader {
                path: path.to_path_buf(),
            });
        }
        Ok(fields)
    }

    pub fn header(&self) -> &DbfHeader {
        &self.header
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn requires_memo(&self) -> bool {
        self.requires_memo
    }

    pub fn memo_kind(&self) -> Option<MemoKind> {
        self.memo_kind
    }

    /// CRC-32 (IEEE / zlib variant) of each record's raw bytes, keyed by
    /// 0-based position. A short tail (fewer than `record_length` bytes
    /// remaining) is not treated as a record.
    pub fn compute_record_checksums(&self) -> Result<ChecksumMap> {
        let mut file = File::open(&self.path).map_err(|source| DbfReadError::Open {
            path: self.path.clone(),
            source,
        })?;
        file.seek(SeekFrom::Start(self.header.header_length as u64))
            .map_err(|source| DbfReadError::Io {
                path: self.path.clone(),
                source,
            })?;

        let mut checksums = BTreeMap::new();
        let record_length = self.header.record_length as usize;
        let mut buf = vec![0u8; record_length];

        for index in 0..self.header.num_records {
            match file.read_exact(&mut buf) {
                Ok(()) => {
                    checksums.insert(index, crc32_ieee(&buf));
                }
                Err(_) => break, // short tail: stop, do not record a partial entry
            }
        }
        Ok(checksums)
    }

    /// Reads a single record by index, decoded into a `DomainRow`.
    pub fn read_record(&self, index: u32) -> Result<DomainRow> {
        if index >= self.header.num_records {
            return Err(DbfReadError::IndexOutOfBounds {
                index,
                count: self.header.num_records,
            });
        }
        let mut file = File::open(&self.path).map_err(|source| DbfReadError::Open {
            path: self.path.clone(),
            source,
        })?;
        let offset =
            self.header.header_length as u64 + index as u64 * self.header.record_length as u64;
        file.seek(SeekFrom::Start(offset))
            .map_err(|source| DbfReadError::Io {
                path: self.path.clone(),
                source,
            })?;
        let mut buf = vec![0u8; self.header.record_length as usize];
        file.read_exact(&mut buf)
            .map_err(|source| DbfReadError::Io {
                path: self.path.clone(),
                source,
            })?;

        let mut memo = self.open_memo()?;
        decode_record(&buf, &self.fields, memo.as_mut())
    }

    /// A lazy, single-pass, in-file-order iterator over all records.
    /// Buffers a `BufReader` but never materializes the whole table.
    pub fn read_all_records(&self) -> Result<RecordIter> {
        let file = File::open(&self.path).map_err(|source| DbfReadError::Open {
            path: self.path.clone(),
            source,
        })?;
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(self.header.header_length as u64))
            .map_err(|source| DbfReadError::Io {
                path: self.path.clone(),
                source,
            })?;

        let memo = self.open_memo()?;

        Ok(RecordIter {
            reader,
            fields: self.fields.clone(),
            record_length: self.header.record_length as usize,
            total: self.header.num_records,
            next_index: 0,
            memo,
            path: self.path.clone(),
        })
    }

    fn open_memo(&self) -> Result<Option<MemoReader>> {
        match (&self.memo_path, self.memo_kind) {
            (Some(path), Some(kind)) => Ok(Some(MemoReader::open(path, kind).map_err(|source| {
                DbfReadError::Io {
                    path: path.clone(),
                    source,
                }
            })?)),
            _ => Ok(None),
        }
    }
}

/// Iterator returned by `DbfReader::read_all_records`.
pub struct RecordIter {
    reader: BufReader<File>,
    fields: Vec<FieldDescriptor>,
    record_length: usize,
    total: u32,
    next_index: u32,
    memo: Option<MemoReader>,
    path: PathBuf,
}

impl Iterator for RecordIter {
    type Item = Result<DomainRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index >= self.total {
            return None;
        }
        let mut buf = vec![0u8; self.record_length];
        if let Err(source) = self.reader.read_exact(&mut buf) {
            if source.kind() == std::io::ErrorKind::UnexpectedEof {
                return None; // short tail: finished early, not an error
            }
            return Some(Err(DbfReadError::Io {
                path: self.path.clone(),
                source,
            }));
        }
        self.next_index += 1;
        Some(decode_record(&buf, &self.fields, self.memo.as_mut()))
    }
}

fn decode_record(
    raw: &[u8],
    fields: &[FieldDescriptor],
    mut memo: Option<&mut MemoReader>,
) -> Result<DomainRow> {
    let mut row = DomainRow::new();
    for field in fields {
        if field.offset >= raw.len() {
            row.insert(field.name.clone(), FieldValue::Null);
            continue;
        }
        let end = (field.offset + field.length as usize).min(raw.len());
        let data = &raw[field.offset..end];
        let value = decode_field(data, field, memo.as_deref_mut());
        row.insert(field.name.clone(), value);
    }
    Ok(row)
}

fn decode_field(
    data: &[u8],
    field: &FieldDescriptor,
    memo: Option<&mut MemoReader>,
) -> FieldValue {
    match field.kind {
        FieldKind::Character => FieldValue::Text(decode_text(data)),
        FieldKind::Numeric => {
            let text = decode_ascii_trimmed(data);
            if text.is_empty() {
                return FieldValue::Null;
            }
            if field.decimal_count == 0 {
                text.parse::<i64>().map(FieldValue::Integer).unwrap_or_else(|_| {
                    text.parse::<f64>()
                        .map(FieldValue::Decimal)
                        .unwrap_or(FieldValue::Null)
                })
            } else {
                text.parse::<f64>()
                    .map(FieldValue::Decimal)
                    .unwrap_or(FieldValue::Null)
            }
        }
        FieldKind::Float => {
            let text = decode_ascii_trimmed(data);
            if text.is_empty() {
                FieldValue::Null
            } else {
                text.parse::<f64>()
                    .map(FieldValue::Decimal)
                    .unwrap_or(FieldValue::Null)
            }
        }
        FieldKind::Logical => match data.first() {
            Some(b'T' | b't' | b'Y' | b'y') => FieldValue::Boolean(true),
            Some(b'F' | b'f' | b'N' | b'n') => FieldValue::Boolean(false),
            _ => FieldValue::Null,
        },
        FieldKind::Date => {
            let text = decode_ascii_trimmed(data);
            if text.len() == 8 {
                chrono::NaiveDate::parse_from_str(&text, "%Y%m%d")
                    .map(FieldValue::Date)
                    .unwrap_or(FieldValue::Null)
            } else {
                FieldValue::Null
            }
        }
        FieldKind::Memo => decode_memo_pointer(data, memo),
        FieldKind::Other(_) => FieldValue::Text(decode_text(data)),
    }
}

fn decode_memo_pointer(data: &[u8], memo: Option<&mut MemoReader>) -> FieldValue {
    let ascii_pointer = std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.trim().parse::<u32>().ok());
    let pointer = ascii_pointer.or_else(|| {
        if data.len() >= 4 {
            let mut cursor = std::io::Cursor::new(&data[0..4]);
            cursor.read_u32::<LittleEndian>().ok()
        } else {
            None
        }
    });

    match (pointer, memo) {
        (Some(p), Some(reader)) if p != 0 => reader
            .read_text(p)
            .map(FieldValue::Text)
            .unwrap_or(FieldValue::Null),
        _ => FieldValue::Null,
    }
}

/// DBF character fields are space-padded, not NUL-terminated (unlike the
/// `.fic` format this reader was adapted from).
fn decode_text(data: &[u8]) -> String {
    let (decoded, _, had_errors) = WINDOWS_1252.decode(data);
    let text = if had_errors {
        std::str::from_utf8(data)
            .map(|s| s.to_string())
            .unwrap_or_else(|_| decoded.into_owned())
    } else {
        decoded.into_owned()
    };
    text.trim_end().to_string()
}

fn decode_ascii_trimmed(data: &[u8]) -> String {
    String::from_utf8_lossy(data).trim().to_string()
}

/// CRC-32 (IEEE 802.3 polynomial), the variant emitted by zlib's `crc32`
/// (and by `zlib.crc32` in the reference implementation this was ported from).
fn crc32_ieee(data: &[u8]) -> u32 {
    const POLY: u32 = 0xEDB8_8320;
    static TABLE: once_cell::sync::Lazy<[u32; 256]> = once_cell::sync::Lazy::new(|| {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut c = i as u32;
            for _ in 0..8 {
                c = if c & 1 != 0 { POLY ^ (c >> 1) } else { c >> 1 };
            }
            *entry = c;
        }
        table
    });

    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = TABLE[idx] ^ (crc >> 8);
    }
    crc ^ 0xFFFF_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_header(
        buf: &mut Vec<u8>,
        db_type: u8,
        num_records: u32,
        header_length: u16,
        record_length: u16,
    ) {
        buf.push(db_type);
        buf.extend_from_slice(&[0u8; 3]); // last-update date, unused here
        buf.extend_from_slice(&num_records.to_le_bytes());
        buf.extend_from_slice(&header_length.to_le_bytes());
        buf.extend_from_slice(&record_length.to_le_bytes());
        buf.extend_from_slice(&[0u8; 20]); // reserved
    }

    fn write_field(buf: &mut Vec<u8>, name: &str, kind: u8, length: u8, decimal_count: u8) {
        let mut name_bytes = [0u8; 11];
        let bytes = name.as_bytes();
        name_bytes[..bytes.len()].copy_from_slice(bytes);
        buf.extend_from_slice(&name_bytes);
        buf.push(kind);
        buf.extend_from_slice(&[0u8; 4]);
        buf.push(length);
        buf.push(decimal_count);
        buf.extend_from_slice(&[0u8; 14]);
    }

    /// Builds a minimal valid `.DBF` with one `C` field ("NOMCLI", 10 chars)
    /// and the given record values.
    fn build_dbf(values: &[&str]) -> NamedTempFile {
        let record_length = 1 + 10; // deletion flag + NOMCLI(10)
        let mut header = Vec::new();
        write_header(
            &mut header,
            0x03,
            values.len() as u32,
            32 + 32 + 1,
            record_length,
        );
        write_field(&mut header, "NOMCLI", b'C', 10, 0);
        header.push(0x0D);

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&header).unwrap();
        for v in values {
            file.write_all(b" ").unwrap(); // not deleted
            let mut padded = v.as_bytes().to_vec();
            padded.resize(10, b' ');
            file.write_all(&padded).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn reads_header_and_fields() {
        let file = build_dbf(&["ALICE", "BOB"]);
        let reader = DbfReader::open(file.path()).unwrap();
        assert_eq!(reader.header().num_records, 2);
        assert_eq!(reader.fields().len(), 1);
        assert_eq!(reader.fields()[0].name, "NOMCLI");
        assert!(!reader.requires_memo());
    }

    #[test]
    fn decodes_character_field_trimmed() {
        let file = build_dbf(&["ALICE"]);
        let reader = DbfReader::open(file.path()).unwrap();
        let row = reader.read_record(0).unwrap();
        assert_eq!(row.get("NOMCLI").unwrap().as_text(), Some("ALICE"));
    }

    #[test]
    fn read_all_records_matches_count() {
        let file = build_dbf(&["ALICE", "BOB", "CAROL"]);
        let reader = DbfReader::open(file.path()).unwrap();
        let rows: Result<Vec<_>> = reader.read_all_records().unwrap().collect();
        assert_eq!(rows.unwrap().len(), 3);
    }

    #[test]
    fn checksum_map_has_one_entry_per_record() {
        let file = build_dbf(&["ALICE", "BOB"]);
        let reader = DbfReader::open(file.path()).unwrap();
        let checksums = reader.compute_record_checksums().unwrap();
        assert_eq!(checksums.len(), 2);
        assert_ne!(checksums[&0], checksums[&1]);
    }

    #[test]
    fn checksum_changes_when_record_bytes_change() {
        let file_a = build_dbf(&["ALICE"]);
        let file_b = build_dbf(&["ALICE2"]);
        let a = DbfReader::open(file_a.path())
            .unwrap()
            .compute_record_checksums()
            .unwrap();
        let b = DbfReader::open(file_b.path())
            .unwrap()
            .compute_record_checksums()
            .unwrap();
        assert_ne!(a[&0], b[&0]);
    }

    #[test]
    fn missing_memo_sidecar_is_an_error() {
        let record_length = 1 + 4;
        let mut header = Vec::new();
        write_header(&mut header, 0x03, 1, 32 + 32 + 1, record_length);
        write_field(&mut header, "NOTE", b'M', 4, 0);
        header.push(0x0D);

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&header).unwrap();
        file.write_all(b" 0000").unwrap();
        file.flush().unwrap();

        let err = DbfReader::open(file.path()).unwrap_err();
        assert!(matches!(err, DbfReadError::MissingMemoSidecar { .. }));
    }
}
