//! PFS0 partition file system: the NSP container and the file system of
//! unencrypted NCA sections.
//!
//! ```text
//! "PFS0" | u32 file_count | u32 string_table_size | u32 reserved
//! file_count × { u64 offset | u64 size | u32 name_offset | u32 reserved }
//! string table
//! ```
//! Entry offsets are relative to the end of the header.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

use super::{table_name, FormatError};

pub const PFS0_MAGIC: &[u8; 4] = b"PFS0";
pub const ENTRY_SIZE: u64 = 0x18;
/// Header alignment written by older tooling.
pub const LEGACY_ALIGN: u64 = 0x10;
/// Header alignment written when padding is normalised.
pub const FIXED_ALIGN: u64 = 0x20;

const MAX_FILES: u32 = 0x10000;
const MAX_STRING_TABLE: u32 = 16 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pfs0Entry {
    pub name:   String,
    pub offset: u64,
    pub size:   u64,
}

#[derive(Debug, Clone)]
pub struct Pfs0Header {
    pub entries:     Vec<Pfs0Entry>,
    /// Header length including the string table; file data starts here.
    pub header_size: u64,
}

impl Pfs0Header {
    /// Parse a header from the reader's current position.  `base` is the
    /// absolute position of the header and is only used for diagnostics.
    pub fn read<R: Read>(reader: R, base: u64) -> Result<Self, FormatError> {
        Self::read_fields(reader, base).map_err(|e| e.truncated(base, "PFS0 header"))
    }

    fn read_fields<R: Read>(mut reader: R, base: u64) -> Result<Self, FormatError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != PFS0_MAGIC {
            return Err(FormatError::at(base, format!("expected PFS0 magic, found {:02x?}", magic)));
        }
        let count = reader.read_u32::<LittleEndian>()?;
        let table_size = reader.read_u32::<LittleEndian>()?;
        let _reserved = reader.read_u32::<LittleEndian>()?;
        if count > MAX_FILES || table_size > MAX_STRING_TABLE {
            return Err(FormatError::at(base + 4, format!(
                "implausible PFS0 header ({count} files, {table_size} byte string table)"
            )));
        }

        let mut raw = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let offset = reader.read_u64::<LittleEndian>()?;
            let size = reader.read_u64::<LittleEndian>()?;
            let name_offset = reader.read_u32::<LittleEndian>()?;
            let _reserved = reader.read_u32::<LittleEndian>()?;
            raw.push((offset, size, name_offset));
        }
        let mut table = vec![0u8; table_size as usize];
        reader.read_exact(&mut table)?;

        let table_base = base + 0x10 + ENTRY_SIZE * count as u64;
        let entries = raw
            .into_iter()
            .map(|(offset, size, name_offset)| {
                Ok(Pfs0Entry { name: table_name(&table, name_offset, table_base)?, offset, size })
            })
            .collect::<Result<Vec<_>, FormatError>>()?;

        Ok(Self { entries, header_size: table_base - base + table_size as u64 })
    }

    pub fn find(&self, pred: impl Fn(&str) -> bool) -> Option<&Pfs0Entry> {
        self.entries.iter().find(|e| pred(&e.name))
    }
}

/// Build a PFS0 header for files laid out back to back in the given order.
/// The string table is zero-padded so the header length is a multiple of
/// `align`.
pub fn encode_header(files: &[(String, u64)], align: u64) -> Vec<u8> {
    let mut table = Vec::new();
    let mut name_offsets = Vec::with_capacity(files.len());
    for (name, _) in files {
        name_offsets.push(table.len() as u32);
        table.extend_from_slice(name.as_bytes());
        table.push(0);
    }
    let fixed = 0x10 + ENTRY_SIZE * files.len() as u64;
    let unpadded = fixed + table.len() as u64;
    let padded = unpadded.div_ceil(align.max(1)) * align.max(1);
    table.resize((padded - fixed) as usize, 0);

    let mut out = Vec::with_capacity(padded as usize);
    out.extend_from_slice(PFS0_MAGIC);
    // Writes into a Vec cannot fail.
    let _ = out.write_u32::<LittleEndian>(files.len() as u32);
    let _ = out.write_u32::<LittleEndian>(table.len() as u32);
    let _ = out.write_u32::<LittleEndian>(0);
    let mut offset = 0u64;
    for ((_, size), name_offset) in files.iter().zip(name_offsets) {
        let _ = out.write_u64::<LittleEndian>(offset);
        let _ = out.write_u64::<LittleEndian>(*size);
        let _ = out.write_u32::<LittleEndian>(name_offset);
        let _ = out.write_u32::<LittleEndian>(0);
        offset += size;
    }
    out.extend_from_slice(&table);
    out
}

/// Header plus data, in memory.
pub fn encode(files: &[(String, Vec<u8>)], align: u64) -> Vec<u8> {
    let sizes: Vec<(String, u64)> = files.iter().map(|(n, d)| (n.clone(), d.len() as u64)).collect();
    let mut out = encode_header(&sizes, align);
    for (_, data) in files {
        out.extend_from_slice(data);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_aligned_and_parses_back() {
        let files = vec![("abc.nca".to_string(), 100u64), ("x.tik".to_string(), 7)];
        for align in [LEGACY_ALIGN, FIXED_ALIGN] {
            let bytes = encode_header(&files, align);
            assert_eq!(bytes.len() as u64 % align, 0);
            let h = Pfs0Header::read(&bytes[..], 0).unwrap();
            assert_eq!(h.header_size, bytes.len() as u64);
            assert_eq!(h.entries[1], Pfs0Entry { name: "x.tik".into(), offset: 100, size: 7 });
        }
    }

    #[test]
    fn name_offset_out_of_table_is_rejected() {
        let mut bytes = encode_header(&[("a".to_string(), 1)], LEGACY_ALIGN);
        bytes[0x20] = 0xFF;
        assert!(matches!(Pfs0Header::read(&bytes[..], 0), Err(FormatError::Structure { .. })));
    }

    #[test]
    fn absurd_file_count_is_rejected_before_allocating() {
        let mut bytes = b"PFS0".to_vec();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(Pfs0Header::read(&bytes[..], 0), Err(FormatError::Structure { .. })));
    }
}
