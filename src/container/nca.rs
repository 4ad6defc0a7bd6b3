//! NCA content-unit header fields used for classification.
//!
//! Parsing works on the decrypted 0xC00-byte header; see
//! [`crate::crypto::decrypt_header`] for the encrypted form.

use byteorder::{ByteOrder, LittleEndian};

use super::FormatError;

pub const NCA_HEADER_SIZE: usize = 0xC00;
/// Header + section headers + hash tables; never compressed.
pub const UNCOMPRESSABLE_HEADER_SIZE: u64 = 0x4000;
pub const MEDIA_UNIT: u64 = 0x200;

const MAGIC_AT: usize = 0x200;
const SECTION_TABLE: usize = 0x240;
const FS_HEADERS: usize = 0x400;
const FS_HEADER_SIZE: usize = 0x200;

pub const FS_TYPE_PFS0: u8 = 2;
pub const CRYPTO_NONE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaContentType {
    Program,
    Meta,
    Control,
    Manual,
    Data,
    PublicData,
    Unknown(u8),
}

impl NcaContentType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => NcaContentType::Program,
            1 => NcaContentType::Meta,
            2 => NcaContentType::Control,
            3 => NcaContentType::Manual,
            4 => NcaContentType::Data,
            5 => NcaContentType::PublicData,
            other => NcaContentType::Unknown(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            NcaContentType::Program    => 0,
            NcaContentType::Meta       => 1,
            NcaContentType::Control    => 2,
            NcaContentType::Manual     => 3,
            NcaContentType::Data       => 4,
            NcaContentType::PublicData => 5,
            NcaContentType::Unknown(b) => b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NcaSection {
    pub index:       usize,
    /// Offset from the start of the NCA.
    pub offset:      u64,
    pub size:        u64,
    pub fs_type:     u8,
    pub crypto_type: u8,
    /// PFS0 location relative to the section start (PFS0 sections only).
    pub pfs0_offset: u64,
    pub pfs0_size:   u64,
}

impl NcaSection {
    pub fn is_plain_pfs0(&self) -> bool {
        self.fs_type == FS_TYPE_PFS0 && self.crypto_type == CRYPTO_NONE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NcaHeader {
    pub magic:        [u8; 4],
    pub content_type: NcaContentType,
    pub content_size: u64,
    pub title_id:     u64,
    pub sdk_version:  u32,
    pub rights_id:    [u8; 16],
    pub sections:     Vec<NcaSection>,
}

/// Whether a raw header is already plaintext.
pub fn is_plaintext(raw: &[u8]) -> bool {
    raw.len() >= NCA_HEADER_SIZE && matches!(&raw[MAGIC_AT..MAGIC_AT + 4], b"NCA3" | b"NCA2")
}

impl NcaHeader {
    pub fn parse(plain: &[u8]) -> Result<Self, FormatError> {
        if plain.len() < NCA_HEADER_SIZE {
            return Err(FormatError::at(0, format!("NCA header truncated ({} bytes)", plain.len())));
        }
        if !is_plaintext(plain) {
            return Err(FormatError::at(MAGIC_AT as u64, "NCA header magic mismatch"));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&plain[MAGIC_AT..MAGIC_AT + 4]);
        let content_size = LittleEndian::read_u64(&plain[0x208..0x210]);
        let mut rights_id = [0u8; 16];
        rights_id.copy_from_slice(&plain[0x230..0x240]);

        let mut sections = Vec::new();
        for index in 0..4 {
            let entry = &plain[SECTION_TABLE + index * 0x10..];
            let start = LittleEndian::read_u32(&entry[0..4]) as u64 * MEDIA_UNIT;
            let end = LittleEndian::read_u32(&entry[4..8]) as u64 * MEDIA_UNIT;
            if end <= start || end > content_size {
                continue;
            }
            let fs = &plain[FS_HEADERS + index * FS_HEADER_SIZE..FS_HEADERS + (index + 1) * FS_HEADER_SIZE];
            sections.push(NcaSection {
                index,
                offset: start,
                size: end - start,
                fs_type: fs[3],
                crypto_type: fs[4],
                pfs0_offset: LittleEndian::read_u64(&fs[0x40..0x48]),
                pfs0_size: LittleEndian::read_u64(&fs[0x48..0x50]),
            });
        }
        sections.sort_by_key(|s| s.offset);

        Ok(Self {
            magic,
            content_type: NcaContentType::from_byte(plain[0x205]),
            content_size,
            title_id: LittleEndian::read_u64(&plain[0x210..0x218]),
            sdk_version: LittleEndian::read_u32(&plain[0x21C..0x220]),
            rights_id,
            sections,
        })
    }

    pub fn has_rights_id(&self) -> bool {
        self.rights_id.iter().any(|b| *b != 0)
    }

    /// Serialize as a plaintext header.  Fields this type does not model are zero.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; NCA_HEADER_SIZE];
        out[MAGIC_AT..MAGIC_AT + 4].copy_from_slice(&self.magic);
        out[0x205] = self.content_type.to_byte();
        LittleEndian::write_u64(&mut out[0x208..0x210], self.content_size);
        LittleEndian::write_u64(&mut out[0x210..0x218], self.title_id);
        LittleEndian::write_u32(&mut out[0x21C..0x220], self.sdk_version);
        out[0x230..0x240].copy_from_slice(&self.rights_id);
        for s in &self.sections {
            let entry = SECTION_TABLE + s.index * 0x10;
            LittleEndian::write_u32(&mut out[entry..entry + 4], (s.offset / MEDIA_UNIT) as u32);
            LittleEndian::write_u32(&mut out[entry + 4..entry + 8], ((s.offset + s.size) / MEDIA_UNIT) as u32);
            let fs = FS_HEADERS + s.index * FS_HEADER_SIZE;
            out[fs] = 2;
            out[fs + 3] = s.fs_type;
            out[fs + 4] = s.crypto_type;
            LittleEndian::write_u64(&mut out[fs + 0x40..fs + 0x48], s.pfs0_offset);
            LittleEndian::write_u64(&mut out[fs + 0x48..fs + 0x50], s.pfs0_size);
        }
        out
    }
}
