//! Packaged content metadata (`*.cnmt`), the record inside a Meta NCA that
//! lists every content unit belonging to one title version.

use byteorder::{ByteOrder, LittleEndian};

use crate::container::FormatError;

const HEADER_SIZE: usize = 0x20;
const RECORD_SIZE: usize = 0x38;

/// Content type value of a delta fragment inside a CNMT record.
pub const CONTENT_DELTA_FRAGMENT: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaType {
    Application,
    Patch,
    AddOnContent,
    Delta,
    Other(u8),
}

impl MetaType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x80 => MetaType::Application,
            0x81 => MetaType::Patch,
            0x82 => MetaType::AddOnContent,
            0x83 => MetaType::Delta,
            other => MetaType::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            MetaType::Application  => 0x80,
            MetaType::Patch        => 0x81,
            MetaType::AddOnContent => 0x82,
            MetaType::Delta        => 0x83,
            MetaType::Other(b)     => b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnmtContent {
    pub hash:         [u8; 32],
    pub nca_id:       [u8; 16],
    pub size:         u64,
    pub content_type: u8,
}

impl CnmtContent {
    pub fn nca_id_hex(&self) -> String {
        hex::encode(self.nca_id)
    }

    pub fn is_delta_fragment(&self) -> bool {
        self.content_type == CONTENT_DELTA_FRAGMENT
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cnmt {
    pub title_id:  u64,
    pub version:   u32,
    pub meta_type: MetaType,
    pub contents:  Vec<CnmtContent>,
}

impl Cnmt {
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < HEADER_SIZE {
            return Err(FormatError::at(0, "CNMT shorter than its header"));
        }
        let title_id = LittleEndian::read_u64(&data[0..8]);
        let version = LittleEndian::read_u32(&data[8..12]);
        let meta_type = MetaType::from_byte(data[0x0C]);
        let ext_size = LittleEndian::read_u16(&data[0x0E..0x10]) as usize;
        let count = LittleEndian::read_u16(&data[0x10..0x12]) as usize;

        let start = HEADER_SIZE + ext_size;
        let end = start + count * RECORD_SIZE;
        if end > data.len() {
            return Err(FormatError::at(0x10, format!(
                "{count} content records do not fit in {} bytes", data.len()
            )));
        }
        let contents = data[start..end]
            .chunks_exact(RECORD_SIZE)
            .map(|rec| {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&rec[..0x20]);
                let mut nca_id = [0u8; 16];
                nca_id.copy_from_slice(&rec[0x20..0x30]);
                CnmtContent {
                    hash,
                    nca_id,
                    size: LittleEndian::read_u48(&rec[0x30..0x36]),
                    content_type: rec[0x36],
                }
            })
            .collect();
        Ok(Self { title_id, version, meta_type, contents })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_SIZE + self.contents.len() * RECORD_SIZE];
        LittleEndian::write_u64(&mut out[0..8], self.title_id);
        LittleEndian::write_u32(&mut out[8..12], self.version);
        out[0x0C] = self.meta_type.to_byte();
        LittleEndian::write_u16(&mut out[0x10..0x12], self.contents.len() as u16);
        for (i, c) in self.contents.iter().enumerate() {
            let rec = &mut out[HEADER_SIZE + i * RECORD_SIZE..HEADER_SIZE + (i + 1) * RECORD_SIZE];
            rec[..0x20].copy_from_slice(&c.hash);
            rec[0x20..0x30].copy_from_slice(&c.nca_id);
            LittleEndian::write_u48(&mut rec[0x30..0x36], c.size);
            rec[0x36] = c.content_type;
        }
        out
    }

    /// Whether the content unit with this NCA id is a delta fragment.
    pub fn is_delta_fragment(&self, nca_id_hex: &str) -> bool {
        self.contents
            .iter()
            .any(|c| c.is_delta_fragment() && c.nca_id_hex().eq_ignore_ascii_case(nca_id_hex))
    }
}
