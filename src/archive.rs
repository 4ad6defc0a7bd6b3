//! High-level [`Archive`] API over a compressed container.
//!
//! ```no_run
//! use nsz::archive::Archive;
//!
//! let mut ar = Archive::open("game.nsz")?;
//! for entry in ar.list() {
//!     println!("{} {} -> {}", entry.name, entry.length, entry.compressed_size);
//! }
//! let ticket = ar.read_entry("0100000000010000.tik")?;
//! # Ok::<(), nsz::NszError>(())
//! ```

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use regex::Regex;

use crate::classify::ContentUnit;
use crate::container::ContainerFormat;
use crate::error::{NszError, Result};
use crate::index::ArchiveIndex;
use crate::io_stream::{ArchiveReader, DecodeSettings};
use crate::perf::CancelToken;

/// Decode threads for a single entry.
const ENTRY_THREADS: usize = 2;

// ── EntryInfo ────────────────────────────────────────────────────────────────

/// Lightweight descriptor returned by [`Archive::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name:            String,
    /// Offset of the entry in the original container.
    pub offset:          u64,
    pub length:          u64,
    /// On-disk bytes of the entry's own blocks.  Zero for solid archives.
    pub compressed_size: u64,
    pub unit:            Option<ContentUnit>,
}

// ── Archive ──────────────────────────────────────────────────────────────────

pub struct Archive {
    reader: ArchiveReader,
}

impl Archive {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self { reader: ArchiveReader::open(path)? })
    }

    pub fn path(&self) -> &Path { self.reader.path() }

    pub fn format(&self) -> ContainerFormat { self.reader.index.format }

    pub fn source_size(&self) -> u64 { self.reader.index.source_size }

    pub fn is_solid(&self) -> bool { self.reader.index.solid.is_some() }

    pub fn index(&self) -> &ArchiveIndex { &self.reader.index }

    /// Content units recorded at compression time.
    pub fn units(&self) -> Vec<ContentUnit> {
        self.reader.index.units().cloned().collect()
    }

    /// Container entries in source order.
    pub fn list(&self) -> Vec<EntryInfo> {
        let mut out: Vec<EntryInfo> = Vec::new();
        for r in &self.reader.index.regions {
            let Some(name) = &r.entry else { continue };
            let compressed: u64 = r.blocks.iter().map(|b| b.compressed_length).sum();
            match out.last_mut() {
                Some(last) if &last.name == name => {
                    last.length += r.length;
                    last.compressed_size += compressed;
                    if last.unit.is_none() {
                        last.unit = r.unit.clone();
                    }
                }
                _ => out.push(EntryInfo {
                    name: name.clone(),
                    offset: r.offset,
                    length: r.length,
                    compressed_size: compressed,
                    unit: r.unit.clone(),
                }),
            }
        }
        out
    }

    fn regions_of(&self, name: &str) -> Vec<usize> {
        self.reader
            .index
            .regions
            .iter()
            .enumerate()
            .filter(|(_, r)| r.entry.as_deref() == Some(name))
            .map(|(i, _)| i)
            .collect()
    }

    /// Stream one entry into `out`.  Non-solid archives decode only the
    /// entry's blocks.
    pub fn read_entry_to<W: Write>(&mut self, name: &str, out: &mut W, cancel: &CancelToken) -> Result<()> {
        let regions = self.regions_of(name);
        if regions.is_empty() {
            return Err(NszError::invalid("entry", format!("{name} is not in {}", self.path().display())));
        }
        let path = self.path().to_owned();
        let settings = DecodeSettings { strict_padding: false, threads: ENTRY_THREADS, cancel };
        for ri in regions {
            self.reader.decode_region_to(ri, out, &path, &settings)?;
        }
        Ok(())
    }

    /// Read one entry into memory.  Meant for small entries such as tickets
    /// and CNMTs; use [`Archive::read_entry_to`] or [`Archive::extract`] for
    /// content.
    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_entry_to(name, &mut out, &CancelToken::new())?;
        Ok(out)
    }

    /// Write every entry whose name (or content unit name) matches
    /// `selector` under `dest`.  Returns the written paths; no match is an
    /// empty result.
    pub fn extract(&mut self, selector: &Regex, dest: &Path, cancel: &CancelToken) -> Result<Vec<PathBuf>> {
        let selected: Vec<EntryInfo> = self
            .list()
            .into_iter()
            .filter(|e| selector.is_match(&e.name) || e.unit.as_ref().is_some_and(|u| selector.is_match(&u.name)))
            .collect();
        if selected.is_empty() {
            return Ok(Vec::new());
        }

        let mut targets = Vec::with_capacity(selected.len());
        for e in &selected {
            match entry_output_path(dest, &e.name) {
                Some(p) => targets.push((e, p)),
                None => tracing::warn!(entry = %e.name, "skipping entry with an unsafe name"),
            }
        }

        if self.is_solid() {
            // One pass over the stream instead of re-decoding it per entry.
            let ranges = targets.iter().map(|(e, p)| (e.offset, e.length, p.clone())).collect();
            let splitter = EntrySplitter::new(ranges).map_err(|(p, e)| NszError::io(p, e))?;
            let settings = DecodeSettings { strict_padding: false, threads: 1, cancel };
            let (splitter, _) = self.reader.decode_to(splitter, dest, &settings)?;
            splitter.finish().map_err(|(p, e)| NszError::io(p, e))?;
        } else {
            for (e, path) in &targets {
                if cancel.is_cancelled() {
                    return Err(NszError::Cancelled { path: self.path().to_owned() });
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| NszError::io(parent, e))?;
                }
                let file = File::create(path).map_err(|e| NszError::io(path, e))?;
                let mut out = BufWriter::new(file);
                self.read_entry_to(&e.name, &mut out, cancel)?;
                out.into_inner()
                    .map_err(|e| NszError::io(path, e.into_error()))?
                    .sync_all()
                    .map_err(|e| NszError::io(path, e))?;
            }
        }

        let out: Vec<PathBuf> = targets.into_iter().map(|(_, p)| p).collect();
        tracing::info!(archive = %self.path().display(), entries = out.len(), "extracted");
        Ok(out)
    }
}

/// `dest/<entry name>`, refusing names that would escape `dest`.
pub fn entry_output_path(dest: &Path, name: &str) -> Option<PathBuf> {
    let rel = Path::new(name);
    if name.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(dest.join(rel))
}

// ── EntrySplitter ────────────────────────────────────────────────────────────

/// Routes a sequential container stream into one file per selected range.
struct EntrySplitter {
    ranges:   Vec<(u64, u64, PathBuf)>,
    open:     HashMap<usize, File>,
    position: u64,
}

impl EntrySplitter {
    fn new(mut ranges: Vec<(u64, u64, PathBuf)>) -> std::result::Result<Self, (PathBuf, io::Error)> {
        ranges.sort_by_key(|r| r.0);
        let mut open = HashMap::new();
        for (i, (_, _, path)) in ranges.iter().enumerate() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| (parent.to_owned(), e))?;
            }
            open.insert(i, File::create(path).map_err(|e| (path.clone(), e))?);
        }
        Ok(Self { ranges, open, position: 0 })
    }

    fn finish(mut self) -> std::result::Result<(), (PathBuf, io::Error)> {
        for (i, file) in self.open.drain() {
            file.sync_all().map_err(|e| (self.ranges[i].2.clone(), e))?;
        }
        Ok(())
    }
}

impl Write for EntrySplitter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let start = self.position;
        let end = start + buf.len() as u64;
        for (i, (offset, length, _)) in self.ranges.iter().enumerate() {
            let (lo, hi) = (start.max(*offset), end.min(offset + length));
            if lo >= hi {
                continue;
            }
            if let Some(file) = self.open.get_mut(&i) {
                file.write_all(&buf[(lo - start) as usize..(hi - start) as usize])?;
            }
        }
        self.position = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.open.values_mut().try_for_each(|f| f.flush())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsafe_names_are_refused() {
        let dest = Path::new("/tmp/out");
        assert_eq!(entry_output_path(dest, "secure/a.nca"), Some(dest.join("secure/a.nca")));
        assert_eq!(entry_output_path(dest, "../a.nca"), None);
        assert_eq!(entry_output_path(dest, "/etc/passwd"), None);
        assert_eq!(entry_output_path(dest, ""), None);
    }

    #[test]
    fn splitter_routes_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("sub/b");
        let mut s = EntrySplitter::new(vec![(2, 3, a.clone()), (6, 2, b.clone())]).unwrap();
        s.write_all(b"0123").unwrap();
        s.write_all(b"456789").unwrap();
        s.finish().unwrap();
        assert_eq!(fs::read(a).unwrap(), b"234");
        assert_eq!(fs::read(b).unwrap(), b"67");
    }
}
