//! Container reader.
//!
//! Opening a container reads only its headers and produces an ordered list
//! of [`Region`]s that exactly tile the file.  Payload bytes are read on
//! demand through [`Container::range_reader`].
//!
//! | Format | Regions |
//! |--------|---------|
//! | PFS0 (`.nsp`) | file table header, then one region per entry |
//! | XCI (`.xci`)  | gamecard header, root HFS0 header, partition HFS0 headers, entries |
//! | NCA (`.nca`)  | the content unit itself |
//!
//! Every `.nca` entry is split into a `ContentUnitHeader` region (the NCA
//! header plus the section header area, kept verbatim) and a
//! `ContentUnitBody` region.

pub mod hfs0;
pub mod nca;
pub mod pfs0;
pub mod xci;

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Take};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{retry_io, NszError, Result};
use self::nca::{NCA_HEADER_SIZE, UNCOMPRESSABLE_HEADER_SIZE};

/// Deepest HFS0-in-HFS0 nesting accepted before the input is rejected.
pub const MAX_NESTING_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("at offset {offset:#x}: {message}")]
    Structure { offset: u64, message: String },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FormatError {
    pub fn at(offset: u64, message: impl Into<String>) -> Self {
        FormatError::Structure { offset, message: message.into() }
    }

    /// A short read inside a declared header means the header claims more
    /// than the file holds.
    pub fn truncated(self, offset: u64, what: &str) -> Self {
        match self {
            FormatError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                FormatError::at(offset, format!("{what} extends past the end of the file"))
            }
            other => other,
        }
    }
}

// ── Formats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    /// Installable package (PFS0).
    Pfs0,
    /// Gamecard disk image.
    Xci,
    /// A single content unit.
    Nca,
}

impl ContainerFormat {
    pub fn tag(self) -> u8 {
        match self {
            ContainerFormat::Pfs0 => 0,
            ContainerFormat::Xci  => 1,
            ContainerFormat::Nca  => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ContainerFormat::Pfs0),
            1 => Some(ContainerFormat::Xci),
            2 => Some(ContainerFormat::Nca),
            _ => None,
        }
    }

    pub fn container_extension(self) -> &'static str {
        match self {
            ContainerFormat::Pfs0 => "nsp",
            ContainerFormat::Xci  => "xci",
            ContainerFormat::Nca  => "nca",
        }
    }

    pub fn archive_extension(self) -> &'static str {
        match self {
            ContainerFormat::Pfs0 => "nsz",
            ContainerFormat::Xci  => "xcz",
            ContainerFormat::Nca  => "ncz",
        }
    }

    /// Boundary that trailing filler runs end on.
    pub fn alignment(self) -> u64 {
        match self {
            ContainerFormat::Pfs0 => 0x10,
            ContainerFormat::Xci | ContainerFormat::Nca => nca::MEDIA_UNIT,
        }
    }
}

/// What a path holds, judged by its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Container(ContainerFormat),
    Archive(ContainerFormat),
}

impl FileKind {
    pub fn of(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        Some(match ext.as_str() {
            "nsp" => FileKind::Container(ContainerFormat::Pfs0),
            "xci" => FileKind::Container(ContainerFormat::Xci),
            "nca" => FileKind::Container(ContainerFormat::Nca),
            "nsz" => FileKind::Archive(ContainerFormat::Pfs0),
            "xcz" => FileKind::Archive(ContainerFormat::Xci),
            "ncz" => FileKind::Archive(ContainerFormat::Nca),
            _ => return None,
        })
    }

    pub fn require(path: &Path) -> Result<Self> {
        Self::of(path).ok_or_else(|| {
            NszError::invalid("source", format!("{}: unsupported file extension", path.display()))
        })
    }
}

// ── Regions ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    RawBytes,
    ContentUnitHeader,
    ContentUnitBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub name:   String,
    pub kind:   RegionKind,
    pub offset: u64,
    pub length: u64,
    /// Index into [`Container::entries`] for regions that belong to a file entry.
    pub entry:  Option<usize>,
}

impl Region {
    pub fn end(&self) -> u64 { self.offset + self.length }
}

/// A named file inside the container (`secure/abc.nca`, `abc.tik`, …).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name:   String,
    pub offset: u64,
    pub length: u64,
}

pub fn is_nca_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".nca")
}

// ── Container ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Container {
    pub path:    PathBuf,
    pub format:  ContainerFormat,
    pub size:    u64,
    pub regions: Vec<Region>,
    pub entries: Vec<Entry>,
}

impl Container {
    /// Open a container, inferring the format from the extension.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match FileKind::require(path)? {
            FileKind::Container(format) => Self::open_as(path, format),
            FileKind::Archive(_) => Err(NszError::invalid(
                "source",
                format!("{} is already compressed", path.display()),
            )),
        }
    }

    pub fn open_as(path: impl AsRef<Path>, format: ContainerFormat) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = retry_io(&path, || File::open(&path))?;
        let size = file.metadata().map_err(|e| NszError::io(&path, e))?.len();
        let mut reader = BufReader::new(file);

        let mut layout = Layout::new(size);
        let parsed = match format {
            ContainerFormat::Pfs0 => layout.walk_pfs0(&mut reader),
            ContainerFormat::Xci  => layout.walk_xci(&mut reader),
            ContainerFormat::Nca  => layout.walk_nca(&path),
        };
        parsed.map_err(|e| NszError::malformed(&path, e))?;
        let (regions, entries) = layout.finish();

        tracing::debug!(path = %path.display(), ?format, regions = regions.len(), entries = entries.len(), "opened container");
        Ok(Self { path, format, size, regions, entries })
    }

    pub fn open_file(&self) -> Result<File> {
        retry_io(&self.path, || File::open(&self.path))
    }

    /// A reader positioned at `offset` and limited to `length` bytes.
    pub fn range_reader<'a>(&self, file: &'a mut File, offset: u64, length: u64) -> Result<Take<&'a mut File>> {
        file.seek(SeekFrom::Start(offset)).map_err(|e| NszError::io(&self.path, e))?;
        Ok(file.take(length))
    }

    pub fn read_range(&self, file: &mut File, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|e| NszError::io(&self.path, e))?;
        Ok(buf)
    }

    /// Index of the header region belonging to each content unit.
    pub fn unit_headers(&self) -> impl Iterator<Item = (usize, &Region)> {
        self.regions.iter().enumerate().filter(|(_, r)| r.kind == RegionKind::ContentUnitHeader)
    }

    /// The body region that follows a unit header, if the unit has a body.
    pub fn body_of(&self, header_idx: usize) -> Option<usize> {
        let header = self.regions.get(header_idx)?;
        let next = self.regions.get(header_idx + 1)?;
        (next.kind == RegionKind::ContentUnitBody && next.entry == header.entry).then_some(header_idx + 1)
    }
}

// ── Layout builder ───────────────────────────────────────────────────────────

/// Accumulates regions in file order and enforces that they tile the file.
struct Layout {
    file_len: u64,
    cursor:   u64,
    regions:  Vec<Region>,
    entries:  Vec<Entry>,
}

impl Layout {
    fn new(file_len: u64) -> Self {
        Self { file_len, cursor: 0, regions: Vec::new(), entries: Vec::new() }
    }

    fn finish(mut self) -> (Vec<Region>, Vec<Entry>) {
        if self.cursor < self.file_len {
            let (start, len) = (self.cursor, self.file_len - self.cursor);
            self.push(Region { name: "trailing".into(), kind: RegionKind::RawBytes, offset: start, length: len, entry: None });
        }
        (self.regions, self.entries)
    }

    fn push(&mut self, region: Region) {
        if region.length == 0 {
            return;
        }
        self.cursor = region.end();
        self.regions.push(region);
    }

    fn raw(&mut self, name: impl Into<String>, offset: u64, length: u64) {
        self.push(Region { name: name.into(), kind: RegionKind::RawBytes, offset, length, entry: None });
    }

    /// Account for bytes between the cursor and `offset`.
    fn gap_until(&mut self, offset: u64, label: &str) -> Result<(), FormatError> {
        if offset < self.cursor {
            return Err(FormatError::at(offset, format!("{label} overlaps the previous region")));
        }
        if offset > self.cursor {
            let start = self.cursor;
            self.raw(format!("{label} gap"), start, offset - start);
        }
        Ok(())
    }

    fn check_bounds(&self, offset: u64, length: u64, what: &str) -> Result<u64, FormatError> {
        let end = offset
            .checked_add(length)
            .ok_or_else(|| FormatError::at(offset, format!("{what}: length overflow")))?;
        if end > self.file_len {
            return Err(FormatError::at(offset, format!(
                "{what}: declared end {end:#x} exceeds file size {:#x}", self.file_len
            )));
        }
        Ok(end)
    }

    /// A file entry: NCAs are split into header + body.
    fn file_entry(&mut self, name: String, offset: u64, length: u64) -> Result<(), FormatError> {
        self.check_bounds(offset, length, &name)?;
        self.gap_until(offset, &name)?;
        let idx = self.entries.len();
        self.entries.push(Entry { name: name.clone(), offset, length });

        if is_nca_name(&name) && length >= NCA_HEADER_SIZE as u64 {
            let header_len = length.min(UNCOMPRESSABLE_HEADER_SIZE);
            self.push(Region {
                name: name.clone(),
                kind: RegionKind::ContentUnitHeader,
                offset,
                length: header_len,
                entry: Some(idx),
            });
            self.push(Region {
                name,
                kind: RegionKind::ContentUnitBody,
                offset: offset + header_len,
                length: length - header_len,
                entry: Some(idx),
            });
        } else {
            self.push(Region { name, kind: RegionKind::RawBytes, offset, length, entry: Some(idx) });
        }
        Ok(())
    }

    fn walk_nca(&mut self, path: &Path) -> Result<(), FormatError> {
        if self.file_len < NCA_HEADER_SIZE as u64 {
            return Err(FormatError::at(0, "file is shorter than an NCA header"));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "content.nca".to_string());
        let name = if is_nca_name(&name) { name } else { format!("{name}.nca") };
        self.file_entry(name, 0, self.file_len)
    }

    fn walk_pfs0<R: Read + Seek>(&mut self, reader: &mut R) -> Result<(), FormatError> {
        reader.seek(SeekFrom::Start(0))?;
        let header = pfs0::Pfs0Header::read(reader, 0)?;
        let data_start = header.header_size;
        self.check_bounds(0, data_start, "PFS0 header")?;
        self.raw("pfs0 header", 0, data_start);

        let mut files = header.entries;
        files.sort_by_key(|e| e.offset);
        for e in files {
            let abs = data_start
                .checked_add(e.offset)
                .ok_or_else(|| FormatError::at(e.offset, "PFS0 entry offset overflow"))?;
            self.file_entry(e.name, abs, e.size)?;
        }
        Ok(())
    }

    fn walk_xci<R: Read + Seek>(&mut self, reader: &mut R) -> Result<(), FormatError> {
        let card = xci::XciHeader::read(reader, self.file_len)?;
        self.check_bounds(card.root_hfs0_offset, hfs0::HFS0_MIN_HEADER, "root HFS0")?;
        self.raw("xci header", 0, card.root_hfs0_offset);
        self.walk_hfs0(reader, card.root_hfs0_offset, "", 1)
    }

    fn walk_hfs0<R: Read + Seek>(&mut self, reader: &mut R, base: u64, prefix: &str, depth: usize) -> Result<(), FormatError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(FormatError::at(base, format!("HFS0 nesting deeper than {MAX_NESTING_DEPTH}")));
        }
        reader.seek(SeekFrom::Start(base))?;
        let header = hfs0::Hfs0Header::read(&mut *reader, base)?;
        let data_start = base + header.header_size;
        self.check_bounds(base, header.header_size, "HFS0 header")?;
        self.gap_until(base, "hfs0")?;
        self.raw(format!("{prefix}hfs0 header"), base, header.header_size);

        let mut files = header.entries;
        files.sort_by_key(|e| e.offset);
        for e in files {
            let abs = data_start
                .checked_add(e.offset)
                .ok_or_else(|| FormatError::at(data_start, "HFS0 entry offset overflow"))?;
            self.check_bounds(abs, e.size, &e.name)?;
            if e.size >= hfs0::HFS0_MIN_HEADER && hfs0::has_magic(reader, abs)? {
                self.gap_until(abs, &e.name)?;
                let nested = format!("{prefix}{}/", e.name);
                let before = self.cursor;
                self.walk_hfs0(reader, abs, &nested, depth + 1)?;
                let end = abs + e.size;
                if self.cursor > end {
                    return Err(FormatError::at(before, format!("partition {} spills past its entry", e.name)));
                }
                if self.cursor < end {
                    let start = self.cursor;
                    self.raw(format!("{nested}tail"), start, end - start);
                }
            } else {
                self.file_entry(format!("{prefix}{}", e.name), abs, e.size)?;
            }
        }
        Ok(())
    }
}

/// Read a NUL-terminated name from a string table.
pub(crate) fn table_name(table: &[u8], at: u32, base: u64) -> Result<String, FormatError> {
    let start = at as usize;
    if start >= table.len() {
        return Err(FormatError::at(base, format!("string table offset {at:#x} out of bounds")));
    }
    let len = table[start..]
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| FormatError::at(base, "string table name missing NUL terminator"))?;
    std::str::from_utf8(&table[start..start + len])
        .map(str::to_owned)
        .map_err(|_| FormatError::at(base, "entry name is not valid UTF-8"))
}
