//! Reading of `.DBT`/`.FPT` memo sidecars referenced by `M`-type DBF fields.
//!
//! - `.FPT` (FoxPro): 512-byte header (next free block, block size, both
//!   big-endian), then blocks of `{u32 type, u32 length}` + `length` bytes,
//!   addressed by `block_index * block_size`.
//! - `.DBT` (dBase III/IV): blocks are addressed directly by byte offset
//!   (the pointer stored in the field *is* the offset in some dialects, the
//!   block index in others); each memo is free text terminated by two
//!   `0x1A` bytes.
//!
//! Used by `core::reader` to resolve memo pointers into text.

use byteorder::{BigEndian, ReadBytesExt};
use encoding_rs::WINDOWS_1252;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoKind {
    Dbt,
    Fpt,
}

impl MemoKind {
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            MemoKind::Dbt => &["dbt"],
            MemoKind::Fpt => &["fpt"],
        }
    }
}

pub struct MemoReader {
    file: File,
    kind: MemoKind,
    block_size: u32,
}

impl MemoReader {
    pub fn open<P: AsRef<Path>>(path: P, kind: MemoKind) -> std::io::Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;

        let block_size = match kind {
            MemoKind::Fpt => {
                file.seek(SeekFrom::Start(6))?;
                let size = file.read_u16::<BigEndian>()? as u32;
                if size == 0 {
                    512
                } else {
                    size
                }
            }
            MemoKind::Dbt => 512,
        };

        Ok(Self {
            file,
            kind,
            block_size,
        })
    }

    /// Resolves a memo pointer (block index for FPT, block index or byte
    /// offset for DBT depending on dialect) into decoded text.
    pub fn read_text(&mut self, pointer: u32) -> std::io::Result<String> {
        let bytes = match self.kind {
            MemoKind::Fpt => self.read_fpt_block(pointer)?,
            MemoKind::Dbt => self.read_dbt_block(pointer)?,
        };
        Ok(decode_memo_text(&bytes))
    }

    fn read_fpt_block(&mut self, block_index: u32) -> std::io::Result<Vec<u8>> {
        let offset = block_index as u64 * self.block_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let _block_type = self.file.read_u32::<BigEndian>()?;
        let length = self.file.read_u32::<BigEndian>()?;
        let mut data = vec![0u8; length as usize];
        self.file.read_exact(&mut data)?;
        Ok(data)
    }

    fn read_dbt_block(&mut self, block_index: u32) -> std::io::Result<Vec<u8>> {
        let offset = block_index as u64 * self.block_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let read = self.file.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            if let Some(pos) = find_terminator(&chunk[..read]) {
                data.extend_from_slice(&chunk[..pos]);
                break;
            }
            data.extend_from_slice(&chunk[..read]);
        }
        Ok(data)
    }
}

fn find_terminator(chunk: &[u8]) -> Option<usize> {
    chunk.windows(2).position(|w| w == [0x1A, 0x1A])
}

fn decode_memo_text(data: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(data) {
        return text.trim_end_matches(['\u{0}', '\u{1a}']).to_string();
    }
    let (decoded, _, _) = WINDOWS_1252.decode(data);
    decoded
        .into_owned()
        .trim_end_matches(['\u{0}', '\u{1a}'])
        .to_string()
}
