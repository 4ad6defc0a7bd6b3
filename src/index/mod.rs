use serde::{Deserialize, Serialize};

use crate::classify::ContentUnit;
use crate::container::{ContainerFormat, RegionKind};

/// One compressed block of a region's payload.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    /// Offset of the first covered byte in the original container.
    pub source_offset:       u64,
    /// Offset of the block header in the archive.
    pub compressed_offset:   u64,
    /// Payload length on disk (excluding the block header).
    pub compressed_length:   u64,
    pub uncompressed_length: u64,
    pub crc32:               u32,
    pub stored:              bool,
}

/// Trailing filler removed before compression and regenerated on decode.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct PaddingRecord {
    pub fill:   u8,
    pub length: u64,
}

/// Where a region's bytes sit inside the decoded solid stream.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct SolidRange {
    pub intra_offset: u64,
    pub intra_length: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RegionRecord {
    pub name:   String,
    pub kind:   RegionKind,
    pub offset: u64,
    pub length: u64,
    /// Name of the container entry this region belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry:  Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit:   Option<ContentUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding: Option<PaddingRecord>,
    #[serde(default)]
    pub blocks: Vec<BlockEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solid_range: Option<SolidRange>,
}

impl RegionRecord {
    /// Bytes actually encoded (the region minus its padding record).
    pub fn payload_length(&self) -> u64 {
        self.length - self.padding.map_or(0, |p| p.length)
    }

    pub fn end(&self) -> u64 { self.offset + self.length }
}

/// Codec parameters the archive was produced with.  Informational on decode.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StoredParams {
    pub level:               i32,
    pub block_size_exponent: u8,
    pub solid:               bool,
    pub long_distance_mode:  bool,
    pub fix_padding:         bool,
}

/// Archive trailer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ArchiveIndex {
    pub format:      ContainerFormat,
    pub source_size: u64,
    pub params:      StoredParams,
    pub regions:     Vec<RegionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solid:       Option<BlockEntry>,
    /// BLAKE3 of the whole original container, hex.
    pub checksum:    String,
}

/// A block located by its archive-wide number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation<'a> {
    pub number: usize,
    pub region: Option<usize>,
    pub entry:  &'a BlockEntry,
}

impl ArchiveIndex {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Every block in archive-wide order: the solid stream first, then each
    /// region's blocks in region order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockLocation<'_>> {
        let solid = self.solid.iter().map(|b| (None, b));
        let regular = self
            .regions
            .iter()
            .enumerate()
            .flat_map(|(ri, r)| r.blocks.iter().map(move |b| (Some(ri), b)));
        solid
            .chain(regular)
            .enumerate()
            .map(|(number, (region, entry))| BlockLocation { number, region, entry })
    }

    pub fn block_count(&self) -> usize {
        self.solid.iter().count() + self.regions.iter().map(|r| r.blocks.len()).sum::<usize>()
    }

    /// Archive-wide number of a region's first block.
    pub fn first_block_of(&self, region: usize) -> usize {
        self.solid.iter().count() + self.regions[..region].iter().map(|r| r.blocks.len()).sum::<usize>()
    }

    /// Consistency of the recorded layout: regions tile `source_size`, block
    /// lists cover their payloads, solid ranges stay inside the stream.
    pub fn check_layout(&self) -> Result<(), String> {
        let mut cursor = 0u64;
        for r in &self.regions {
            if r.offset != cursor {
                return Err(format!("region {} starts at {:#x}, expected {cursor:#x}", r.name, r.offset));
            }
            if let Some(p) = r.padding {
                if p.length > r.length {
                    return Err(format!("region {} padding longer than the region", r.name));
                }
            }
            let payload = r.payload_length();
            match r.solid_range {
                Some(range) => {
                    let stream = self.solid.as_ref().map_or(0, |s| s.uncompressed_length);
                    if range.intra_length != payload || range.intra_offset + range.intra_length > stream {
                        return Err(format!("region {} solid range out of bounds", r.name));
                    }
                }
                None => {
                    let mut at = r.offset;
                    for b in &r.blocks {
                        if b.source_offset != at {
                            return Err(format!("region {} block at {:#x} not contiguous", r.name, b.source_offset));
                        }
                        at += b.uncompressed_length;
                    }
                    if at - r.offset != payload {
                        return Err(format!("region {} blocks cover {:#x} of {payload:#x} bytes", r.name, at - r.offset));
                    }
                }
            }
            cursor = r.end();
        }
        if cursor != self.source_size {
            return Err(format!("regions cover {cursor:#x} of {:#x} bytes", self.source_size));
        }
        Ok(())
    }

    pub fn units(&self) -> impl Iterator<Item = &ContentUnit> {
        self.regions.iter().filter_map(|r| r.unit.as_ref())
    }
}
