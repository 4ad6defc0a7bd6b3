//! HFS0: the hashed partition file system used inside gamecard images.
//!
//! Same shape as PFS0 but with 0x40-byte entries that carry a SHA-256 of the
//! first `hashed_size` bytes of each file.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom};

use super::{table_name, FormatError};

pub const HFS0_MAGIC: &[u8; 4] = b"HFS0";
pub const ENTRY_SIZE: u64 = 0x40;
/// Smallest possible header (no entries, empty string table).
pub const HFS0_MIN_HEADER: u64 = 0x10;

const MAX_FILES: u32 = 0x10000;
const MAX_STRING_TABLE: u32 = 16 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hfs0Entry {
    pub name:        String,
    pub offset:      u64,
    pub size:        u64,
    pub hashed_size: u32,
    pub hash:        [u8; 32],
}

#[derive(Debug, Clone)]
pub struct Hfs0Header {
    pub entries:     Vec<Hfs0Entry>,
    pub header_size: u64,
}

impl Hfs0Header {
    pub fn read<R: Read>(reader: R, base: u64) -> Result<Self, FormatError> {
        Self::read_fields(reader, base).map_err(|e| e.truncated(base, "HFS0 header"))
    }

    fn read_fields<R: Read>(mut reader: R, base: u64) -> Result<Self, FormatError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != HFS0_MAGIC {
            return Err(FormatError::at(base, format!("expected HFS0 magic, found {:02x?}", magic)));
        }
        let count = reader.read_u32::<LittleEndian>()?;
        let table_size = reader.read_u32::<LittleEndian>()?;
        let _reserved = reader.read_u32::<LittleEndian>()?;
        if count > MAX_FILES || table_size > MAX_STRING_TABLE {
            return Err(FormatError::at(base + 4, format!(
                "implausible HFS0 header ({count} files, {table_size} byte string table)"
            )));
        }

        let mut raw = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let offset = reader.read_u64::<LittleEndian>()?;
            let size = reader.read_u64::<LittleEndian>()?;
            let name_offset = reader.read_u32::<LittleEndian>()?;
            let hashed_size = reader.read_u32::<LittleEndian>()?;
            let mut reserved = [0u8; 8];
            reader.read_exact(&mut reserved)?;
            let mut hash = [0u8; 32];
            reader.read_exact(&mut hash)?;
            raw.push((offset, size, name_offset, hashed_size, hash));
        }
        let mut table = vec![0u8; table_size as usize];
        reader.read_exact(&mut table)?;

        let table_base = base + 0x10 + ENTRY_SIZE * count as u64;
        let entries = raw
            .into_iter()
            .map(|(offset, size, name_offset, hashed_size, hash)| {
                Ok(Hfs0Entry {
                    name: table_name(&table, name_offset, table_base)?,
                    offset,
                    size,
                    hashed_size,
                    hash,
                })
            })
            .collect::<Result<Vec<_>, FormatError>>()?;

        Ok(Self { entries, header_size: table_base - base + table_size as u64 })
    }
}

/// Whether the bytes at `offset` start an HFS0 header.
pub fn has_magic<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<bool, FormatError> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    Ok(&magic == HFS0_MAGIC)
}

/// Build an HFS0 header for files laid out back to back.  Hash fields are
/// zero; nothing here checks them.
pub fn encode_header(files: &[(String, u64)]) -> Vec<u8> {
    let mut table = Vec::new();
    let mut name_offsets = Vec::with_capacity(files.len());
    for (name, _) in files {
        name_offsets.push(table.len() as u32);
        table.extend_from_slice(name.as_bytes());
        table.push(0);
    }
    let fixed = 0x10 + ENTRY_SIZE * files.len() as u64;
    table.resize(((fixed + table.len() as u64).div_ceil(0x200) * 0x200 - fixed) as usize, 0);

    let mut out = Vec::new();
    out.extend_from_slice(HFS0_MAGIC);
    let _ = out.write_u32::<LittleEndian>(files.len() as u32);
    let _ = out.write_u32::<LittleEndian>(table.len() as u32);
    let _ = out.write_u32::<LittleEndian>(0);
    let mut offset = 0u64;
    for ((_, size), name_offset) in files.iter().zip(name_offsets) {
        let _ = out.write_u64::<LittleEndian>(offset);
        let _ = out.write_u64::<LittleEndian>(*size);
        let _ = out.write_u32::<LittleEndian>(name_offset);
        let _ = out.write_u32::<LittleEndian>((*size).min(0x200) as u32);
        out.extend_from_slice(&[0u8; 8 + 32]);
        offset += size;
    }
    out.extend_from_slice(&table);
    out
}
