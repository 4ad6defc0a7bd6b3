//! Gamecard image header.  Only the fields needed to find the root HFS0
//! partition table are read.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom};

use super::FormatError;

pub const HEAD_MAGIC: &[u8; 4] = b"HEAD";
const MAGIC_AT: u64 = 0x100;
/// Some dumps prepend the 0x1000-byte key area.
const KEY_AREA: u64 = 0x1000;
const HEADER_LEN: usize = 0x148;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XciHeader {
    /// 0, or 0x1000 when a key area precedes the card header.
    pub header_offset:    u64,
    pub root_hfs0_offset: u64,
    pub root_hfs0_size:   u64,
}

impl XciHeader {
    pub fn read<R: Read + Seek>(reader: &mut R, file_len: u64) -> Result<Self, FormatError> {
        let header_offset = if has_card_header_at(reader, 0, file_len)? {
            0
        } else if has_card_header_at(reader, KEY_AREA, file_len)? {
            KEY_AREA
        } else {
            return Err(FormatError::at(MAGIC_AT, "XCI header magic mismatch"));
        };

        let mut head = [0u8; HEADER_LEN];
        reader.seek(SeekFrom::Start(header_offset))?;
        reader.read_exact(&mut head)?;
        let rel = LittleEndian::read_u64(&head[0x138..0x140]);
        let root_hfs0_size = LittleEndian::read_u64(&head[0x140..0x148]);

        let root_hfs0_offset = header_offset
            .checked_add(rel)
            .ok_or_else(|| FormatError::at(header_offset + 0x138, "root HFS0 offset overflow"))?;
        if root_hfs0_offset >= file_len {
            return Err(FormatError::at(header_offset + 0x138, format!(
                "root HFS0 offset {root_hfs0_offset:#x} outside file"
            )));
        }
        if root_hfs0_offset.saturating_add(root_hfs0_size) > file_len {
            return Err(FormatError::at(header_offset + 0x140, "root HFS0 header range outside file"));
        }
        Ok(Self { header_offset, root_hfs0_offset, root_hfs0_size })
    }
}

fn has_card_header_at<R: Read + Seek>(reader: &mut R, header_offset: u64, file_len: u64) -> Result<bool, FormatError> {
    if header_offset + HEADER_LEN as u64 > file_len {
        return Ok(false);
    }
    reader.seek(SeekFrom::Start(header_offset + MAGIC_AT))?;
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    Ok(&magic == HEAD_MAGIC)
}

/// A minimal 0x200-byte card header pointing at a root HFS0.
pub fn encode_header(root_offset: u64, root_header_size: u64) -> Vec<u8> {
    let mut out = vec![0u8; 0x200];
    out[0x100..0x104].copy_from_slice(HEAD_MAGIC);
    let mut tail = &mut out[0x138..0x148];
    let _ = tail.write_u64::<LittleEndian>(root_offset);
    let _ = tail.write_u64::<LittleEndian>(root_header_size);
    out
}
