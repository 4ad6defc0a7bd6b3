//! Fixed 64-byte archive header, written as zeros first and patched in
//! place once the trailer has been written.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::container::ContainerFormat;

pub const MAGIC: &[u8; 4] = b"NSZA";
pub const VERSION: u32 = 1;
pub const SUPERBLOCK_SIZE: u64 = 64;

pub const SB_FLAG_SOLID:   u8 = 0x01;
pub const SB_FLAG_PADDING: u8 = 0x02;

#[derive(Error, Debug)]
pub enum SuperblockError {
    #[error("Invalid magic number")]
    InvalidMagic,
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("Unknown container format tag: {0}")]
    UnknownFormat(u8),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub format:         ContainerFormat,
    pub flags:          u8,
    pub source_size:    u64,
    pub trailer_offset: u64,
    pub trailer_size:   u64,
}

impl Superblock {
    pub fn new(format: ContainerFormat, source_size: u64) -> Self {
        Self { format, flags: 0, source_size, trailer_offset: 0, trailer_size: 0 }
    }

    pub fn is_solid(&self) -> bool { self.flags & SB_FLAG_SOLID != 0 }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_u32::<LittleEndian>(VERSION)?;
        writer.write_u8(self.format.tag())?;
        writer.write_u8(self.flags)?;
        writer.write_u16::<LittleEndian>(0)?;
        writer.write_u64::<LittleEndian>(self.source_size)?;
        writer.write_u64::<LittleEndian>(self.trailer_offset)?;
        writer.write_u64::<LittleEndian>(self.trailer_size)?;
        writer.write_all(&[0u8; 28])?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, SuperblockError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(SuperblockError::InvalidMagic);
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(SuperblockError::UnsupportedVersion(version));
        }
        let tag = reader.read_u8()?;
        let format = ContainerFormat::from_tag(tag).ok_or(SuperblockError::UnknownFormat(tag))?;
        let flags = reader.read_u8()?;
        let _reserved = reader.read_u16::<LittleEndian>()?;
        let source_size    = reader.read_u64::<LittleEndian>()?;
        let trailer_offset = reader.read_u64::<LittleEndian>()?;
        let trailer_size   = reader.read_u64::<LittleEndian>()?;
        let mut tail = [0u8; 28];
        reader.read_exact(&mut tail)?;
        Ok(Self { format, flags, source_size, trailer_offset, trailer_size })
    }
}
