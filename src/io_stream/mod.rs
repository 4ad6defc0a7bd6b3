//! Streaming archive engine: writer and reader.
//!
//! # Layout
//! ```text
//! Superblock (64 B) | blocks … | trailer block (zstd JSON ArchiveIndex)
//! ```
//! The superblock is written as zeros first and patched in place once the
//! trailer offset is known.
//!
//! # Writer
//! [`write_archive`] walks the container's regions in source order.  Unit
//! headers and delta fragments are framed verbatim; everything else is
//! compressed.  Without `solid`, payloads are cut into `2^block_size_exponent`
//! blocks that the [`BlockPool`] compresses in parallel and that are written
//! in source order.  With `solid`, every compressible payload is streamed
//! into one zstd frame (block 0) and each region records its intra range in
//! the decoded stream; verbatim regions follow as their own blocks.
//!
//! # Reader
//! [`ArchiveReader`] loads the trailer, checks that the recorded layout
//! tiles the original container, and reconstructs either the whole
//! container ([`ArchiveReader::decode_to`]) or single regions.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Take, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc;

use crate::block::{decode_block, encode_block, frame, BlockHeader, BLOCK_HEADER_SIZE, FLAG_SOLID, FLAG_STORED};
use crate::classify::{Classification, UnitType};
use crate::codec::{CodecError, ZstdCodec};
use crate::config::CodecParams;
use crate::container::{Container, RegionKind};
use crate::error::{retry_io, NszError, Result};
use crate::index::{ArchiveIndex, BlockEntry, PaddingRecord, RegionRecord, SolidRange, StoredParams};
use crate::padding;
use crate::perf::{BlockJobError, BlockPool, CancelToken, TrackedWriter};
use crate::superblock::{Superblock, SuperblockError, SB_FLAG_PADDING, SB_FLAG_SOLID, SUPERBLOCK_SIZE};

const COPY_CHUNK: usize = 1 << 20;
/// The trailer is small and always compressed at a fixed level.
const TRAILER_LEVEL: i32 = 3;

// ── Shared I/O adapters ──────────────────────────────────────────────────────

/// Counts and CRCs everything written through it.
struct CrcWriter<W: Write> {
    inner: W,
    crc:   Crc,
    count: u64,
}

impl<W: Write> CrcWriter<W> {
    fn new(inner: W) -> Self { Self { inner, crc: Crc::new(), count: 0 } }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> { self.inner.flush() }
}

/// CRCs everything read through it.
struct CrcReader<R: Read> {
    inner: R,
    crc:   Crc,
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.crc.update(&buf[..n]);
        Ok(n)
    }
}

/// BLAKE3 and byte count of the reconstructed container.
pub struct HashingWriter<W: Write> {
    inner:   W,
    hasher:  blake3::Hasher,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self { Self { inner, hasher: blake3::Hasher::new(), written: 0 } }

    pub fn written(&self) -> u64 { self.written }

    pub fn finalize(self) -> (W, String) {
        (self.inner, self.hasher.finalize().to_hex().to_string())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> { self.inner.flush() }
}

fn fill_hash(hasher: &mut blake3::Hasher, record: &PaddingRecord) {
    let chunk = vec![record.fill; (record.length as usize).min(COPY_CHUNK)];
    let mut left = record.length;
    while left > 0 {
        let n = left.min(chunk.len() as u64) as usize;
        hasher.update(&chunk[..n]);
        left -= n as u64;
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Settings for one archive encode.
pub struct EncodeSettings<'a> {
    pub params:      CodecParams,
    pub fix_padding: bool,
    pub threads:     usize,
    pub cancel:      &'a CancelToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressReport {
    pub source_size:   u64,
    pub archive_size:  u64,
    pub blocks:        usize,
    pub stored_blocks: usize,
    pub padding_bytes: u64,
    pub checksum:      String,
}

struct RegionPlan {
    stored:  bool,
    padding: Option<PaddingRecord>,
    payload: u64,
}

fn is_stored(container: &Container, classification: &Classification, idx: usize) -> bool {
    match container.regions[idx].kind {
        RegionKind::ContentUnitHeader => true,
        RegionKind::ContentUnitBody => classification
            .unit_for_body(idx)
            .is_some_and(|u| u.unit_type == UnitType::DeltaFragment),
        RegionKind::RawBytes => false,
    }
}

/// Everything one encode needs, with error mapping for both files.
struct Encoder<'a> {
    container: &'a Container,
    src:       File,
    src_path:  &'a Path,
    out:       TrackedWriter<File>,
    out_path:  PathBuf,
    settings:  &'a EncodeSettings<'a>,
    codec:     ZstdCodec,
    hasher:    blake3::Hasher,
    records:   Vec<RegionRecord>,
    stored_blocks: usize,
}

impl<'a> Encoder<'a> {
    fn out_err(&self) -> impl Fn(io::Error) -> NszError + '_ { move |e| NszError::io(&self.out_path, e) }

    fn check_cancel(&self) -> Result<()> {
        if self.settings.cancel.is_cancelled() {
            return Err(NszError::Cancelled { path: self.src_path.to_owned() });
        }
        Ok(())
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let path = self.src_path;
        self.src
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.src.read_exact(buf))
            .map_err(|e| NszError::io(path, e))
    }

    fn write_block(&mut self, header: &BlockHeader, payload: &[u8], source_offset: u64) -> Result<BlockEntry> {
        let compressed_offset = self.out.position();
        let path = self.out_path.clone();
        header
            .write(&mut self.out)
            .and_then(|_| self.out.write_all(payload))
            .map_err(|e| NszError::io(&path, e))?;
        if header.is_stored() {
            self.stored_blocks += 1;
        }
        Ok(BlockEntry {
            source_offset,
            compressed_offset,
            compressed_length: header.compressed_len,
            uncompressed_length: header.uncompressed_len,
            crc32: header.crc32,
            stored: header.is_stored(),
        })
    }

    /// Frame a region verbatim, `block_size` bytes per block.
    fn write_stored_region(&mut self, offset: u64, payload: u64, hash: bool) -> Result<Vec<BlockEntry>> {
        let block_size = self.settings.params.block_size();
        let mut entries = Vec::new();
        let mut at = offset;
        while at < offset + payload {
            self.check_cancel()?;
            let len = (offset + payload - at).min(block_size) as usize;
            let mut buf = vec![0u8; len];
            self.read_exact_at(at, &mut buf)?;
            if hash {
                self.hasher.update(&buf);
            }
            let block = frame(buf, len as u64, FLAG_STORED);
            entries.push(self.write_block(&block.header, &block.payload, at)?);
            at += len as u64;
        }
        Ok(entries)
    }

    /// Compress a region as independent blocks, a pool-sized batch at a time.
    fn write_compressed_region(&mut self, pool: &BlockPool, offset: u64, payload: u64) -> Result<Vec<BlockEntry>> {
        let block_size = self.settings.params.block_size();
        let batch_blocks = (pool.threads() * 2) as u64;
        let mut entries = Vec::new();
        let mut at = offset;
        while at < offset + payload {
            self.check_cancel()?;
            let len = (offset + payload - at).min(block_size * batch_blocks) as usize;
            let mut buf = vec![0u8; len];
            self.read_exact_at(at, &mut buf)?;
            self.hasher.update(&buf);

            let chunks: Vec<&[u8]> = buf.chunks(block_size as usize).collect();
            let blocks = pool
                .encode(&chunks, &self.codec, self.settings.cancel)
                .map_err(|e| match e {
                    BlockJobError::Cancelled => NszError::Cancelled { path: self.src_path.to_owned() },
                    BlockJobError::Codec { source, .. } => NszError::io(&self.out_path, io::Error::other(source)),
                })?;
            let mut source_offset = at;
            for block in blocks {
                let n = block.header.uncompressed_len;
                entries.push(self.write_block(&block.header, &block.payload, source_offset)?);
                source_offset += n;
            }
            at += len as u64;
        }
        Ok(entries)
    }

    /// Feed a region's payload into the solid stream.
    fn stream_region<W: Write>(&mut self, sink: &mut W, raw_crc: &mut Crc, offset: u64, payload: u64) -> Result<()> {
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut at = offset;
        while at < offset + payload {
            self.check_cancel()?;
            let len = (offset + payload - at).min(COPY_CHUNK as u64) as usize;
            self.read_exact_at(at, &mut buf[..len])?;
            self.hasher.update(&buf[..len]);
            raw_crc.update(&buf[..len]);
            sink.write_all(&buf[..len]).map_err(|e| NszError::io(&self.out_path, e))?;
            at += len as u64;
        }
        Ok(())
    }

    /// Hash a verbatim region without writing it (solid pass one).
    fn hash_region(&mut self, offset: u64, payload: u64) -> Result<()> {
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut at = offset;
        while at < offset + payload {
            let len = (offset + payload - at).min(COPY_CHUNK as u64) as usize;
            self.read_exact_at(at, &mut buf[..len])?;
            self.hasher.update(&buf[..len]);
            at += len as u64;
        }
        Ok(())
    }

    fn copy_raw(&mut self, offset: u64, payload: u64) -> Result<()> {
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut at = offset;
        while at < offset + payload {
            let len = (offset + payload - at).min(COPY_CHUNK as u64) as usize;
            self.read_exact_at(at, &mut buf[..len])?;
            let path = self.out_path.clone();
            self.out.write_all(&buf[..len]).map_err(|e| NszError::io(&path, e))?;
            at += len as u64;
        }
        Ok(())
    }

    /// Write the solid block: header placeholder, zstd stream, header patch.
    /// Falls back to a verbatim solid block when compression does not pay.
    fn write_solid(&mut self, plans: &[RegionPlan]) -> Result<Option<BlockEntry>> {
        let solid_len: u64 = plans.iter().filter(|p| !p.stored).map(|p| p.payload).sum();
        let start = self.out.position();
        let out_err = |e: io::Error| NszError::io(&self.out_path, e);
        let placeholder = [0u8; BLOCK_HEADER_SIZE as usize];
        self.out.write_all(&placeholder).map_err(out_err)?;

        let mut raw_crc = Crc::new();
        let out_path = self.out_path.clone();
        let codec = self.codec;
        // The encoder borrows the output while regions are read from the source.
        let mut sink = Vec::new();
        let mut encoder = codec
            .stream_encoder(CrcWriter::new(&mut sink))
            .map_err(|e| NszError::io(&out_path, e))?;
        let mut spilled = 0u64;
        let regions: Vec<(u64, u64, bool, Option<PaddingRecord>)> = self
            .container
            .regions
            .iter()
            .zip(plans)
            .map(|(r, p)| (r.offset, p.payload, p.stored, p.padding))
            .collect();

        for (offset, payload, stored, pad) in regions {
            if stored {
                self.hash_region(offset, payload)?;
            } else {
                self.stream_region(&mut encoder, &mut raw_crc, offset, payload)?;
            }
            if let Some(p) = pad {
                fill_hash(&mut self.hasher, &p);
            }
            // Move finished compressed output to disk as it accumulates.
            if encoder.get_ref().inner.len() >= COPY_CHUNK {
                let bytes = std::mem::take(&mut *encoder.get_mut().inner);
                self.out.write_all(&bytes).map_err(|e| NszError::io(&out_path, e))?;
                spilled += bytes.len() as u64;
            }
        }
        let crc_writer = encoder.finish().map_err(|e| NszError::io(&out_path, e))?;
        let (compressed_len, crc32) = (crc_writer.count, crc_writer.crc.finalize());
        self.out.write_all(&sink).map_err(|e| NszError::io(&out_path, e))?;
        debug_assert_eq!(spilled + sink.len() as u64, compressed_len);

        if solid_len == 0 {
            self.out.truncate(start).map_err(|e| NszError::io(&out_path, e))?;
            return Ok(None);
        }

        let header = if compressed_len < solid_len {
            BlockHeader { flags: FLAG_SOLID, compressed_len, uncompressed_len: solid_len, crc32 }
        } else {
            tracing::debug!(solid_len, compressed_len, "solid stream does not shrink, storing verbatim");
            self.out.truncate(start).map_err(|e| NszError::io(&out_path, e))?;
            let header = BlockHeader {
                flags: FLAG_SOLID | FLAG_STORED,
                compressed_len: solid_len,
                uncompressed_len: solid_len,
                crc32: raw_crc.finalize(),
            };
            let mut head = Vec::with_capacity(BLOCK_HEADER_SIZE as usize);
            header.write(&mut head).map_err(|e| NszError::io(&out_path, e))?;
            self.out.write_all(&head).map_err(|e| NszError::io(&out_path, e))?;
            for (r, p) in self.container.regions.iter().zip(plans) {
                if !p.stored {
                    self.copy_raw(r.offset, p.payload)?;
                }
            }
            if header.is_stored() {
                self.stored_blocks += 1;
            }
            return Ok(Some(BlockEntry {
                source_offset: 0,
                compressed_offset: start,
                compressed_length: solid_len,
                uncompressed_length: solid_len,
                crc32: header.crc32,
                stored: true,
            }));
        };

        let mut head = Vec::with_capacity(BLOCK_HEADER_SIZE as usize);
        header.write(&mut head).map_err(|e| NszError::io(&out_path, e))?;
        self.out.patch(start, &head).map_err(|e| NszError::io(&out_path, e))?;
        Ok(Some(BlockEntry {
            source_offset: 0,
            compressed_offset: start,
            compressed_length: compressed_len,
            uncompressed_length: solid_len,
            crc32,
            stored: false,
        }))
    }
}

/// Compress `container` into `out` (a freshly created, empty file).
pub fn write_archive(
    container: &Container,
    classification: &Classification,
    settings: &EncodeSettings<'_>,
    out: File,
    out_path: &Path,
) -> Result<CompressReport> {
    let params = settings.params;
    let alignment = container.format.alignment();
    let mut src = container.open_file()?;

    let mut plans = Vec::with_capacity(container.regions.len());
    for (idx, r) in container.regions.iter().enumerate() {
        let stored = is_stored(container, classification, idx);
        let padding = if settings.fix_padding && !stored {
            padding::detect(&mut src, r.offset, r.length, alignment).map_err(|e| NszError::io(&container.path, e))?
        } else {
            None
        };
        let payload = r.length - padding.map_or(0, |p| p.length);
        plans.push(RegionPlan { stored, padding, payload });
    }

    let mut enc = Encoder {
        container,
        src,
        src_path: &container.path,
        out: TrackedWriter::new(out, 0),
        out_path: out_path.to_owned(),
        settings,
        codec: params.codec(if params.solid { settings.threads } else { 0 }),
        hasher: blake3::Hasher::new(),
        records: Vec::with_capacity(container.regions.len()),
        stored_blocks: 0,
    };
    enc.out.write_all(&[0u8; SUPERBLOCK_SIZE as usize]).map_err(enc.out_err())?;

    let mut solid = None;
    if params.solid {
        solid = enc.write_solid(&plans)?;
    }

    let pool = BlockPool::new(if params.solid { 1 } else { settings.threads });
    let mut intra = 0u64;
    for (idx, (r, plan)) in container.regions.iter().zip(&plans).enumerate() {
        enc.check_cancel()?;
        let (blocks, solid_range) = if plan.stored {
            (enc.write_stored_region(r.offset, plan.payload, !params.solid)?, None)
        } else if params.solid {
            let range = (plan.payload > 0).then(|| SolidRange { intra_offset: intra, intra_length: plan.payload });
            intra += plan.payload;
            (Vec::new(), range)
        } else {
            let blocks = enc.write_compressed_region(&pool, r.offset, plan.payload)?;
            if let Some(p) = plan.padding {
                fill_hash(&mut enc.hasher, &p);
            }
            (blocks, None)
        };
        tracing::trace!(region = %r.name, blocks = blocks.len(), stored = plan.stored, "region encoded");

        let unit = match r.kind {
            RegionKind::ContentUnitHeader => classification.unit_for_header(idx).cloned(),
            _ => None,
        };
        enc.records.push(RegionRecord {
            name: r.name.clone(),
            kind: r.kind,
            offset: r.offset,
            length: r.length,
            entry: r.entry.and_then(|e| container.entries.get(e)).map(|e| e.name.clone()),
            unit,
            padding: plan.padding,
            blocks,
            solid_range,
        });
    }

    let checksum = enc.hasher.finalize().to_hex().to_string();
    let padding_bytes: u64 = plans.iter().filter_map(|p| p.padding).map(|p| p.length).sum();
    let index = ArchiveIndex {
        format: container.format,
        source_size: container.size,
        params: StoredParams {
            level: params.level,
            block_size_exponent: params.block_size_exponent,
            solid: params.solid,
            long_distance_mode: params.long_distance_mode,
            fix_padding: settings.fix_padding,
        },
        regions: std::mem::take(&mut enc.records),
        solid,
        checksum: checksum.clone(),
    };

    let json = index.to_bytes().map_err(|e| NszError::invalid("index", e.to_string()))?;
    let trailer = encode_block(&json, &ZstdCodec::new(TRAILER_LEVEL, false), false)
        .map_err(|e| NszError::invalid("index", e.to_string()))?;
    let trailer_offset = enc.out.position();
    trailer.write(&mut enc.out).map_err(enc.out_err())?;

    let mut sb = Superblock::new(container.format, container.size);
    sb.trailer_offset = trailer_offset;
    sb.trailer_size = trailer.disk_len();
    if params.solid {
        sb.flags |= SB_FLAG_SOLID;
    }
    if padding_bytes > 0 {
        sb.flags |= SB_FLAG_PADDING;
    }
    let mut head = Vec::with_capacity(SUPERBLOCK_SIZE as usize);
    sb.write(&mut head).map_err(enc.out_err())?;
    enc.out.patch(0, &head).map_err(enc.out_err())?;

    let archive_size = enc.out.position();
    let file = enc.out.into_inner().map_err(|e| NszError::io(out_path, e))?;
    file.sync_all().map_err(|e| NszError::io(out_path, e))?;

    Ok(CompressReport {
        source_size: container.size,
        archive_size,
        blocks: index.block_count(),
        stored_blocks: enc.stored_blocks,
        padding_bytes,
        checksum,
    })
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Options for reconstructing a container.
pub struct DecodeSettings<'a> {
    /// Check padding records strictly before regenerating them.
    pub strict_padding: bool,
    pub threads:        usize,
    pub cancel:         &'a CancelToken,
}

type PayloadReader = Take<BufReader<File>>;

/// The decoded solid stream, read sequentially.
enum SolidStream {
    Zstd(zstd::stream::read::Decoder<'static, BufReader<CrcReader<PayloadReader>>>),
    Raw(CrcReader<PayloadReader>),
}

impl Read for SolidStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SolidStream::Zstd(d) => d.read(buf),
            SolidStream::Raw(r) => r.read(buf),
        }
    }
}

impl SolidStream {
    /// Drain any unread payload and return the CRC of all of it.
    fn finish(self) -> io::Result<u32> {
        let mut crc_reader = match self {
            SolidStream::Zstd(d) => d.finish().into_inner(),
            SolidStream::Raw(r) => r,
        };
        io::copy(&mut crc_reader, &mut io::sink())?;
        Ok(crc_reader.crc.finalize())
    }
}

pub struct ArchiveReader {
    path:           PathBuf,
    file:           File,
    file_len:       u64,
    pub superblock: Superblock,
    pub index:      ArchiveIndex,
}

impl ArchiveReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let mut file = retry_io(&path, || File::open(&path))?;
        let file_len = file.metadata().map_err(|e| NszError::io(&path, e))?.len();
        let malformed = |offset: u64, message: String| NszError::MalformedContainer { path: path.clone(), offset, message };

        let superblock = Superblock::read(&mut file).map_err(|e| match e {
            SuperblockError::Io(e) if e.kind() != io::ErrorKind::UnexpectedEof => NszError::io(&path, e),
            other => malformed(0, format!("superblock: {other}")),
        })?;
        let t_off = superblock.trailer_offset;
        if t_off < SUPERBLOCK_SIZE || t_off.saturating_add(superblock.trailer_size) > file_len {
            return Err(malformed(t_off, "trailer lies outside the file".into()));
        }

        file.seek(SeekFrom::Start(t_off)).map_err(|e| NszError::io(&path, e))?;
        let header = BlockHeader::read(&mut file).map_err(|e| malformed(t_off, format!("trailer: {e}")))?;
        if BLOCK_HEADER_SIZE + header.compressed_len != superblock.trailer_size {
            return Err(malformed(t_off, "trailer length disagrees with the superblock".into()));
        }
        let mut payload = vec![0u8; header.compressed_len as usize];
        file.read_exact(&mut payload).map_err(|e| NszError::io(&path, e))?;
        let json = decode_block(&header, &payload).map_err(|e| malformed(t_off, format!("trailer: {e}")))?;
        let index = ArchiveIndex::from_bytes(&json).map_err(|e| malformed(t_off, format!("index: {e}")))?;

        if index.format != superblock.format || index.source_size != superblock.source_size {
            return Err(malformed(0, "superblock disagrees with the index".into()));
        }
        index.check_layout().map_err(|m| malformed(t_off, m))?;
        for loc in index.blocks() {
            let end = loc.entry.compressed_offset + BLOCK_HEADER_SIZE + loc.entry.compressed_length;
            if loc.entry.compressed_offset < SUPERBLOCK_SIZE || end > t_off {
                return Err(malformed(loc.entry.compressed_offset, format!("block {} lies outside the data area", loc.number)));
            }
        }

        tracing::debug!(path = %path.display(), format = ?index.format, blocks = index.block_count(), "opened archive");
        Ok(Self { path, file, file_len, superblock, index })
    }

    pub fn path(&self) -> &Path { &self.path }

    fn corrupt(&self, block: usize, reason: impl Into<String>) -> NszError {
        NszError::CorruptBlock { path: self.path.clone(), block, reason: reason.into() }
    }

    /// Read a block's header and payload, checking the header against the
    /// index entry.  The payload CRC is checked by [`decode_block`].
    pub fn read_block(&mut self, number: usize, entry: &BlockEntry) -> Result<(BlockHeader, Vec<u8>)> {
        self.file
            .seek(SeekFrom::Start(entry.compressed_offset))
            .map_err(|e| NszError::io(&self.path, e))?;
        let header = BlockHeader::read(&mut self.file).map_err(|e| NszError::corrupt(&self.path, number, e))?;
        if header.compressed_len != entry.compressed_length
            || header.uncompressed_len != entry.uncompressed_length
            || header.crc32 != entry.crc32
            || header.is_stored() != entry.stored
        {
            return Err(self.corrupt(number, "block header disagrees with the index"));
        }
        if entry.compressed_offset + BLOCK_HEADER_SIZE + header.compressed_len > self.file_len {
            return Err(self.corrupt(number, "block payload truncated"));
        }
        let mut payload = vec![0u8; header.compressed_len as usize];
        self.file.read_exact(&mut payload).map_err(|e| NszError::io(&self.path, e))?;
        Ok((header, payload))
    }

    /// Check one block's payload CRC without decoding it.
    pub fn check_block_crc(&mut self, number: usize, entry: &BlockEntry) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(entry.compressed_offset + BLOCK_HEADER_SIZE))
            .map_err(|e| NszError::io(&self.path, e))?;
        let mut reader = CrcReader { inner: (&mut self.file).take(entry.compressed_length), crc: Crc::new() };
        let n = io::copy(&mut reader, &mut io::sink()).map_err(|e| NszError::io(&self.path, e))?;
        let computed = reader.crc.finalize();
        if n != entry.compressed_length {
            return Err(self.corrupt(number, "block payload truncated"));
        }
        if computed != entry.crc32 {
            return Err(NszError::corrupt(&self.path, number, CodecError::Crc { stored: entry.crc32, computed }));
        }
        Ok(())
    }

    /// Fetch and decode one block by archive-wide number (non-solid blocks).
    pub fn decode_block_at(&mut self, number: usize, entry: &BlockEntry) -> Result<Vec<u8>> {
        let (header, payload) = self.read_block(number, entry)?;
        decode_block(&header, &payload).map_err(|e| NszError::corrupt(&self.path, number, e))
    }

    fn open_solid(&self) -> Result<Option<SolidStream>> {
        let Some(solid) = &self.index.solid else { return Ok(None) };
        let mut file = retry_io(&self.path, || File::open(&self.path))?;
        file.seek(SeekFrom::Start(solid.compressed_offset + BLOCK_HEADER_SIZE))
            .map_err(|e| NszError::io(&self.path, e))?;
        let payload = CrcReader { inner: BufReader::new(file).take(solid.compressed_length), crc: Crc::new() };
        Ok(Some(if solid.stored {
            SolidStream::Raw(payload)
        } else {
            SolidStream::Zstd(ZstdCodec::stream_decoder(payload).map_err(|e| self.corrupt(0, e.to_string()))?)
        }))
    }

    fn check_padding(&self, region: &RegionRecord) -> Result<()> {
        padding::check(region, self.index.format.alignment()).map_err(|message| NszError::PaddingMismatch {
            path: self.path.clone(),
            region: region.name.clone(),
            message,
        })
    }

    /// Decode a region's block list into `out`, a pool-sized batch at a time.
    fn decode_blocks_into<W: Write>(&mut self, ri: usize, pool: &BlockPool, cancel: &CancelToken, out: &mut W, out_path: &Path) -> Result<()> {
        let first = self.index.first_block_of(ri);
        let blocks = self.index.regions[ri].blocks.clone();
        let batch = pool.threads() * 2;
        for (bi, group) in blocks.chunks(batch.max(1)).enumerate() {
            if cancel.is_cancelled() {
                return Err(NszError::Cancelled { path: self.path.clone() });
            }
            let base = first + bi * batch;
            let mut framed = Vec::with_capacity(group.len());
            for (k, entry) in group.iter().enumerate() {
                framed.push(self.read_block(base + k, entry)?);
            }
            let decoded = pool.decode(&framed, cancel).map_err(|e| match e {
                BlockJobError::Cancelled => NszError::Cancelled { path: self.path.clone() },
                BlockJobError::Codec { index, source } => NszError::corrupt(&self.path, base + index, source),
            })?;
            for data in decoded {
                out.write_all(&data).map_err(|e| NszError::io(out_path, e))?;
            }
        }
        Ok(())
    }

    /// Reconstruct the whole container into `out`.  Returns the BLAKE3 of
    /// what was written, already checked against the stored checksum.
    pub fn decode_to<W: Write>(&mut self, out: W, out_path: &Path, settings: &DecodeSettings<'_>) -> Result<(W, String)> {
        let pool = BlockPool::new(settings.threads);
        let mut sink = HashingWriter::new(out);
        let mut solid = self.open_solid()?;
        let mut consumed = 0u64;

        for ri in 0..self.index.regions.len() {
            if settings.cancel.is_cancelled() {
                return Err(NszError::Cancelled { path: self.path.clone() });
            }
            let region = self.index.regions[ri].clone();
            if settings.strict_padding {
                self.check_padding(&region)?;
            }

            match (region.solid_range, solid.as_mut()) {
                (Some(range), Some(stream)) => {
                    if range.intra_offset != consumed {
                        return Err(self.corrupt(0, format!("region {} out of stream order", region.name)));
                    }
                    let copied = copy_stream(stream, &mut sink, range.intra_length)
                        .map_err(|e| self.stream_error(e, out_path))?;
                    if copied != range.intra_length {
                        return Err(self.corrupt(0, "solid stream ended early"));
                    }
                    consumed += copied;
                }
                (Some(_), None) => return Err(self.corrupt(0, "region refers to a missing solid stream")),
                (None, _) => self.decode_blocks_into(ri, &pool, settings.cancel, &mut sink, out_path)?,
            }

            if let Some(p) = region.padding {
                padding::regenerate(&mut sink, &p).map_err(|e| NszError::io(out_path, e))?;
            }
        }

        if let (Some(stream), Some(entry)) = (solid, &self.index.solid) {
            let computed = stream.finish().map_err(|e| self.corrupt(0, e.to_string()))?;
            if computed != entry.crc32 {
                return Err(NszError::corrupt(&self.path, 0, CodecError::Crc { stored: entry.crc32, computed }));
            }
        }

        let written = sink.written();
        let (out, actual) = sink.finalize();
        if written != self.index.source_size || actual != self.index.checksum {
            return Err(NszError::ChecksumMismatch {
                path: self.path.clone(),
                expected: self.index.checksum.clone(),
                actual,
            });
        }
        Ok((out, actual))
    }

    /// I/O failures on the output stay I/O errors; anything else in the
    /// solid stream is corruption of block 0.
    fn stream_error(&self, e: StreamError, out_path: &Path) -> NszError {
        match e {
            StreamError::Write(e) => NszError::io(out_path, e),
            StreamError::Read(e) => self.corrupt(0, e.to_string()),
        }
    }

    /// Stream one region (including regenerated padding) into `out`.
    /// Non-solid regions decode only their own blocks, a pool-sized batch
    /// at a time.
    pub fn decode_region_to<W: Write>(&mut self, ri: usize, out: &mut W, out_path: &Path, settings: &DecodeSettings<'_>) -> Result<()> {
        let region = self.index.regions[ri].clone();
        if settings.strict_padding {
            self.check_padding(&region)?;
        }
        match region.solid_range {
            Some(range) => {
                let mut stream = self.open_solid()?.ok_or_else(|| self.corrupt(0, "missing solid stream"))?;
                let skipped = copy_stream(&mut stream, &mut io::sink(), range.intra_offset)
                    .map_err(|e| self.stream_error(e, out_path))?;
                let copied = copy_stream(&mut stream, out, range.intra_length)
                    .map_err(|e| self.stream_error(e, out_path))?;
                if skipped != range.intra_offset || copied != range.intra_length {
                    return Err(self.corrupt(0, "solid stream ended early"));
                }
            }
            None => {
                let pool = BlockPool::new(settings.threads);
                self.decode_blocks_into(ri, &pool, settings.cancel, out, out_path)?;
            }
        }
        if let Some(p) = region.padding {
            padding::regenerate(out, &p).map_err(|e| NszError::io(out_path, e))?;
        }
        Ok(())
    }
}

enum StreamError {
    Read(io::Error),
    Write(io::Error),
}

fn copy_stream<R: Read, W: Write>(reader: &mut R, writer: &mut W, len: u64) -> std::result::Result<u64, StreamError> {
    let mut buf = vec![0u8; COPY_CHUNK.min(len.max(1) as usize)];
    let mut left = len;
    while left > 0 {
        let want = left.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).map_err(StreamError::Read)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).map_err(StreamError::Write)?;
        left -= n as u64;
    }
    Ok(len - left)
}
