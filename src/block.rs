//! On-disk block framing.
//!
//! ```text
//! u32 magic "BLKZ" | u8 flags | 3 reserved | u64 compressed_len
//! | u64 uncompressed_len | u32 crc32(payload) | u32 reserved
//! ```
//! followed by `compressed_len` payload bytes.  A block whose compressed form
//! would not be smaller than its input is written verbatim with
//! [`FLAG_STORED`] set, so a block never expands by more than its header.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use crc32fast::Hasher;

use crate::codec::{get_codec, Codec, CodecError, CodecId, ZstdCodec};

pub const BLOCK_MAGIC: u32 = u32::from_le_bytes(*b"BLKZ");
pub const BLOCK_HEADER_SIZE: u64 = 32;

/// Payload is stored verbatim.
pub const FLAG_STORED: u8 = 0x01;
/// Payload is the archive's single solid stream.
pub const FLAG_SOLID:  u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub flags:            u8,
    pub compressed_len:   u64,
    pub uncompressed_len: u64,
    pub crc32:            u32,
}

impl BlockHeader {
    pub fn is_stored(&self) -> bool { self.flags & FLAG_STORED != 0 }

    pub fn codec(&self) -> CodecId {
        if self.is_stored() { CodecId::Stored } else { CodecId::Zstd }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(BLOCK_MAGIC)?;
        writer.write_u8(self.flags)?;
        writer.write_all(&[0u8; 3])?;
        writer.write_u64::<LittleEndian>(self.compressed_len)?;
        writer.write_u64::<LittleEndian>(self.uncompressed_len)?;
        writer.write_u32::<LittleEndian>(self.crc32)?;
        writer.write_u32::<LittleEndian>(0)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, CodecError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != BLOCK_MAGIC {
            return Err(CodecError::Header(format!("magic {magic:08x}")));
        }
        let flags = reader.read_u8()?;
        let mut reserved = [0u8; 3];
        reader.read_exact(&mut reserved)?;
        let compressed_len   = reader.read_u64::<LittleEndian>()?;
        let uncompressed_len = reader.read_u64::<LittleEndian>()?;
        let crc32            = reader.read_u32::<LittleEndian>()?;
        let _reserved        = reader.read_u32::<LittleEndian>()?;
        Ok(Self { flags, compressed_len, uncompressed_len, crc32 })
    }
}

/// A block ready to be written.
#[derive(Debug)]
pub struct EncodedBlock {
    pub header:  BlockHeader,
    pub payload: Vec<u8>,
}

impl EncodedBlock {
    pub fn disk_len(&self) -> u64 { BLOCK_HEADER_SIZE + self.payload.len() as u64 }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        self.header.write(&mut writer)?;
        writer.write_all(&self.payload)
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Wrap an already-produced payload (stored or compressed) in a header.
pub fn frame(payload: Vec<u8>, uncompressed_len: u64, flags: u8) -> EncodedBlock {
    let header = BlockHeader {
        flags,
        compressed_len: payload.len() as u64,
        uncompressed_len,
        crc32: crc32(&payload),
    };
    EncodedBlock { header, payload }
}

/// Compress one block.  With `store` set, or when compression does not
/// shrink the data, the block is stored verbatim.
pub fn encode_block(data: &[u8], codec: &ZstdCodec, store: bool) -> Result<EncodedBlock, CodecError> {
    if !store && !data.is_empty() {
        let packed = codec.compress(data)?;
        if packed.len() < data.len() {
            return Ok(frame(packed, data.len() as u64, 0));
        }
    }
    Ok(frame(data.to_vec(), data.len() as u64, FLAG_STORED))
}

/// Check a block payload against its header and decode it.
pub fn decode_block(header: &BlockHeader, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let computed = crc32(payload);
    if computed != header.crc32 {
        return Err(CodecError::Crc { stored: header.crc32, computed });
    }
    let expected = header.uncompressed_len;
    let codec = get_codec(header.codec(), ZstdCodec::new(0, false));
    let out = codec.decompress(payload, expected as usize)?;
    if out.len() as u64 != expected {
        return Err(CodecError::Length { expected, actual: out.len() as u64 });
    }
    Ok(out)
}
