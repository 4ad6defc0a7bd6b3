//! Read-only integrity checks of archives and plain containers.
//!
//! A *full* verify decodes the whole archive, which checks every block CRC,
//! the padding records and the stored BLAKE3, and compares the result with
//! the original container when one is at hand.  A *quick* verify decodes the
//! first, middle and last blocks only.  Decode-time integrity failures keep
//! their own kind (`CorruptBlock`, `ChecksumMismatch`, `PaddingMismatch`);
//! disagreement with the original is `VerificationFailed`.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::classify::nca_id_of;
use crate::config::{VerifyMode, VerifyOptions};
use crate::container::{Container, FileKind};
use crate::error::{retry_io, NszError, Result};
use crate::index::ArchiveIndex;
use crate::io_stream::{ArchiveReader, DecodeSettings};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub path:           PathBuf,
    pub mode:           VerifyMode,
    pub blocks_checked: usize,
    /// BLAKE3 of the reconstructed container (full mode).
    pub checksum:       Option<String>,
    pub compared_with:  Option<PathBuf>,
    pub nca_hashes:     usize,
}

// ── Stream taps ──────────────────────────────────────────────────────────────

/// Compares a sequential stream with a file, remembering the first
/// differing offset.  Without a file it only counts.
struct CompareWriter {
    original: Option<BufReader<File>>,
    buf:      Vec<u8>,
    position: u64,
    mismatch: Option<u64>,
}

impl CompareWriter {
    fn new(original: Option<File>) -> Self {
        Self { original: original.map(BufReader::new), buf: Vec::new(), position: 0, mismatch: None }
    }
}

impl Write for CompareWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if let (Some(original), None) = (self.original.as_mut(), self.mismatch) {
            self.buf.resize(data.len(), 0);
            let mut got = 0;
            while got < data.len() {
                let n = original.read(&mut self.buf[got..])?;
                if n == 0 {
                    break;
                }
                got += n;
            }
            if let Some(i) = data[..got].iter().zip(&self.buf[..got]).position(|(a, b)| a != b) {
                self.mismatch = Some(self.position + i as u64);
            } else if got < data.len() {
                self.mismatch = Some(self.position + got as u64);
            }
        }
        self.position += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

struct NcaRange {
    name:     String,
    offset:   u64,
    length:   u64,
    expected: String,
    hasher:   Sha256,
}

/// Hashes every `.nca` entry named by its content id as the stream passes.
struct NcaHashTap<W: Write> {
    inner:    W,
    ranges:   Vec<NcaRange>,
    position: u64,
}

impl<W: Write> NcaHashTap<W> {
    fn new(inner: W, entries: impl Iterator<Item = (String, u64, u64)>) -> Self {
        let ranges = entries
            .filter_map(|(name, offset, length)| {
                let expected = nca_id_of(&name)?;
                Some(NcaRange { name, offset, length, expected, hasher: Sha256::new() })
            })
            .collect();
        Self { inner, ranges, position: 0 }
    }

    /// First entry whose content does not hash to its name.
    fn finish(self) -> (W, usize, Option<(String, u64)>) {
        let checked = self.ranges.len();
        let bad = self.ranges.into_iter().find_map(|r| {
            let digest = r.hasher.finalize();
            (hex::encode(&digest[..16]) != r.expected).then_some((r.name, r.offset))
        });
        (self.inner, checked, bad)
    }
}

impl<W: Write> Write for NcaHashTap<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        let start = self.position;
        let end = start + n as u64;
        for r in &mut self.ranges {
            let (lo, hi) = (start.max(r.offset), end.min(r.offset + r.length));
            if lo < hi {
                r.hasher.update(&buf[(lo - start) as usize..(hi - start) as usize]);
            }
        }
        self.position = end;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> { self.inner.flush() }
}

fn index_entries(index: &ArchiveIndex) -> Vec<(String, u64, u64)> {
    let mut out: Vec<(String, u64, u64)> = Vec::new();
    for r in &index.regions {
        let Some(name) = &r.entry else { continue };
        match out.last_mut() {
            Some(last) if &last.0 == name => last.2 += r.length,
            _ => out.push((name.clone(), r.offset, r.length)),
        }
    }
    out
}

fn hash_failure(path: &Path, name: &str, offset: u64) -> NszError {
    NszError::verification(path, format!("{name} does not hash to its content id"), Some(offset))
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// The original container an archive was produced from, if it still sits
/// next to the archive.
pub fn sibling_original(archive: &Path) -> Option<PathBuf> {
    let FileKind::Archive(format) = FileKind::of(archive)? else { return None };
    let candidate = archive.with_extension(format.container_extension());
    candidate.is_file().then_some(candidate)
}

/// Verify an archive or a plain container.
pub fn verify(path: &Path, opts: &VerifyOptions) -> Result<VerifyReport> {
    match FileKind::require(path)? {
        FileKind::Archive(_) => verify_archive(path, opts),
        FileKind::Container(_) => verify_container(path, opts),
    }
}

pub fn verify_archive(path: &Path, opts: &VerifyOptions) -> Result<VerifyReport> {
    let mut reader = ArchiveReader::open(path)?;
    let report = match opts.mode {
        VerifyMode::Quick => quick(&mut reader, opts)?,
        VerifyMode::Full => full(&mut reader, opts)?,
    };
    tracing::info!(path = %path.display(), mode = ?opts.mode, blocks = report.blocks_checked, "verified");
    Ok(report)
}

fn quick(reader: &mut ArchiveReader, opts: &VerifyOptions) -> Result<VerifyReport> {
    let path = reader.path().to_owned();
    if opts.fix_padding {
        let alignment = reader.index.format.alignment();
        for r in &reader.index.regions {
            crate::padding::check(r, alignment).map_err(|message| NszError::PaddingMismatch {
                path: path.clone(),
                region: r.name.clone(),
                message,
            })?;
        }
    }

    let count = reader.index.block_count();
    let mut picks: Vec<usize> = [0, count / 2, count.saturating_sub(1)].into_iter().filter(|n| *n < count).collect();
    picks.dedup();

    let chosen: Vec<_> = reader
        .index
        .blocks()
        .filter(|b| picks.contains(&b.number))
        .map(|b| (b.number, b.region.is_none(), b.entry.clone()))
        .collect();
    for (number, is_solid, entry) in &chosen {
        if opts.cancel.is_cancelled() {
            return Err(NszError::Cancelled { path });
        }
        if *is_solid {
            reader.check_block_crc(*number, entry)?;
        } else {
            reader.decode_block_at(*number, entry)?;
        }
        tracing::debug!(block = number, "sampled block ok");
    }

    Ok(VerifyReport {
        path,
        mode: VerifyMode::Quick,
        blocks_checked: chosen.len(),
        checksum: None,
        compared_with: None,
        nca_hashes: 0,
    })
}

fn full(reader: &mut ArchiveReader, opts: &VerifyOptions) -> Result<VerifyReport> {
    let path = reader.path().to_owned();
    let original = opts.original.clone().or_else(|| sibling_original(&path));
    let compare = CompareWriter::new(match &original {
        Some(o) => Some(retry_io(o, || File::open(o))?),
        None => None,
    });

    let entries = index_entries(&reader.index);
    let tap = NcaHashTap::new(compare, entries.into_iter());
    let settings = DecodeSettings {
        strict_padding: opts.fix_padding,
        threads: opts.parallelism.threads.resolve(),
        cancel: &opts.cancel,
    };
    let (tap, checksum) = reader.decode_to(tap, &path, &settings)?;
    let (compare, nca_hashes, bad_hash) = tap.finish();

    if let Some(o) = &original {
        let original_len = o.metadata().map_err(|e| NszError::io(o, e))?.len();
        let offset = compare
            .mismatch
            .or_else(|| (original_len != compare.position).then_some(compare.position.min(original_len)));
        if let Some(offset) = offset {
            return Err(NszError::verification(&path, format!("differs from {}", o.display()), Some(offset)));
        }
    }
    if let Some((name, offset)) = bad_hash {
        return Err(hash_failure(&path, &name, offset));
    }

    Ok(VerifyReport {
        path,
        mode: VerifyMode::Full,
        blocks_checked: reader.index.block_count(),
        checksum: Some(checksum),
        compared_with: original,
        nca_hashes,
    })
}

/// A plain container: structure always, content ids in full mode.
pub fn verify_container(path: &Path, opts: &VerifyOptions) -> Result<VerifyReport> {
    let container = Container::open(path)?;
    let mut nca_hashes = 0;
    let mut checksum = None;
    if opts.mode == VerifyMode::Full {
        let entries = container.entries.iter().map(|e| (e.name.clone(), e.offset, e.length));
        let mut tap = NcaHashTap::new(crate::io_stream::HashingWriter::new(io::sink()), entries);
        let mut file = container.open_file()?;
        io::copy(&mut BufReader::new(&mut file), &mut tap).map_err(|e| NszError::io(path, e))?;
        let (hashing, checked, bad) = tap.finish();
        if let Some((name, offset)) = bad {
            return Err(hash_failure(path, &name, offset));
        }
        nca_hashes = checked;
        checksum = Some(hashing.finalize().1);
    }
    Ok(VerifyReport {
        path: path.to_owned(),
        mode: opts.mode,
        blocks_checked: 0,
        checksum,
        compared_with: None,
        nca_hashes,
    })
}
