//! Trailing-filler detection and regeneration.
//!
//! A region that ends on the container's alignment boundary often ends with
//! a long run of `0x00` or `0xFF`.  With padding normalisation the run is
//! recorded as `{fill, length}` instead of being compressed, and written
//! back verbatim on decode.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::index::{PaddingRecord, RegionRecord};

/// Shorter runs are left in the payload.
pub const MIN_RUN: u64 = 64;
const SCAN_CHUNK: usize = 64 * 1024;
const FILL_BYTES: [u8; 2] = [0x00, 0xFF];

/// Find the trailing filler of `[offset, offset + length)` in `reader`.
pub fn detect<R: Read + Seek>(reader: &mut R, offset: u64, length: u64, alignment: u64) -> io::Result<Option<PaddingRecord>> {
    let end = offset + length;
    if length < MIN_RUN || alignment == 0 || end % alignment != 0 {
        return Ok(None);
    }

    let mut buf = vec![0u8; SCAN_CHUNK];
    let mut fill = None;
    let mut run = 0u64;
    let mut pos = end;
    while pos > offset {
        let take = (pos - offset).min(SCAN_CHUNK as u64) as usize;
        pos -= take as u64;
        reader.seek(SeekFrom::Start(pos))?;
        let chunk = &mut buf[..take];
        reader.read_exact(chunk)?;

        let byte = *fill.get_or_insert(chunk[take - 1]);
        if !FILL_BYTES.contains(&byte) {
            return Ok(None);
        }
        let same = chunk.iter().rev().take_while(|b| **b == byte).count();
        run += same as u64;
        if same < take {
            break;
        }
    }

    Ok(match fill {
        Some(fill) if run >= MIN_RUN => Some(PaddingRecord { fill, length: run }),
        _ => None,
    })
}

/// Write the filler a record stands for.
pub fn regenerate<W: Write>(writer: &mut W, record: &PaddingRecord) -> io::Result<()> {
    let chunk = vec![record.fill; (record.length as usize).min(SCAN_CHUNK)];
    let mut left = record.length;
    while left > 0 {
        let n = left.min(chunk.len() as u64) as usize;
        writer.write_all(&chunk[..n])?;
        left -= n as u64;
    }
    Ok(())
}

/// Strict check of a record against the region that carries it.
pub fn check(region: &RegionRecord, alignment: u64) -> Result<(), String> {
    let Some(p) = region.padding else { return Ok(()) };
    if !FILL_BYTES.contains(&p.fill) {
        return Err(format!("fill byte {:#04x} is not a filler value", p.fill));
    }
    if p.length > region.length {
        return Err(format!("filler of {} bytes exceeds region length {}", p.length, region.length));
    }
    if p.length < MIN_RUN {
        return Err(format!("filler of {} bytes is below the {MIN_RUN}-byte minimum", p.length));
    }
    if alignment == 0 || region.end() % alignment != 0 {
        return Err(format!("region end {:#x} is not {alignment:#x}-aligned", region.end()));
    }
    Ok(())
}
