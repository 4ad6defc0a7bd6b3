//! Codec layer: the zstd-family encoder/decoder used for block payloads and
//! solid streams, plus the verbatim "stored" codec used for data that must
//! not (or would not) shrink.
//!
//! # Identity
//! A block's codec is not negotiated.  The block header's `stored` flag picks
//! between [`CodecId::Stored`] and [`CodecId::Zstd`]; the zstd parameters that
//! produced the payload are recorded once per archive in the trailer and are
//! only informational on decode (zstd frames are self-describing).

use std::io::{self, Read, Write};
use thiserror::Error;
use zstd::stream::raw::{CParameter, DParameter};

/// Window used when long-distance matching is requested: 128 MiB.
pub const LONG_WINDOW_LOG: u32 = 27;
/// Largest window a decoder accepts.  Covers every window we ever emit.
pub const MAX_WINDOW_LOG: u32 = 31;

// ── CodecId ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    /// Payload stored verbatim.
    Stored,
    Zstd,
}

/// Codec levels accepted by the linked libzstd.
pub fn level_range() -> std::ops::RangeInclusive<i32> {
    zstd::compression_level_range()
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
    #[error("block checksum mismatch (stored {stored:08x}, computed {computed:08x})")]
    Crc { stored: u32, computed: u32 },
    #[error("decoded {actual} bytes, index records {expected}")]
    Length { expected: u64, actual: u64 },
    #[error("bad block header: {0}")]
    Header(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    /// `expected_len` is the exact decoded size recorded in the index.
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError>;
}

pub struct StoredCodec;
impl Codec for StoredCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8], _: usize) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

/// Zstd with the archive's effort level and optional long-distance matching.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    pub level:         i32,
    pub long_distance: bool,
    /// Worker threads inside libzstd for streaming (solid) encodes.
    pub workers:       u32,
}

impl ZstdCodec {
    pub fn new(level: i32, long_distance: bool) -> Self {
        Self { level, long_distance, workers: 0 }
    }

    pub fn with_workers(mut self, workers: u32) -> Self {
        self.workers = workers;
        self
    }

    /// A streaming encoder configured like [`Codec::compress`]; used for solid
    /// payloads that are fed region by region.
    pub fn stream_encoder<W: Write>(&self, sink: W) -> io::Result<zstd::stream::write::Encoder<'static, W>> {
        let mut enc = zstd::stream::write::Encoder::new(sink, self.level)?;
        if self.long_distance {
            enc.long_distance_matching(true)?;
            enc.window_log(LONG_WINDOW_LOG)?;
        }
        if self.workers > 1 {
            enc.multithread(self.workers)?;
        }
        Ok(enc)
    }

    /// A streaming decoder for solid payloads.
    pub fn stream_decoder<R: Read>(source: R) -> io::Result<zstd::stream::read::Decoder<'static, io::BufReader<R>>> {
        let mut dec = zstd::stream::read::Decoder::new(source)?;
        dec.window_log_max(MAX_WINDOW_LOG)?;
        Ok(dec)
    }
}

impl Codec for ZstdCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let err = |e: io::Error| CodecError::Compression(e.to_string());
        let mut c = zstd::bulk::Compressor::new(self.level).map_err(err)?;
        if self.long_distance {
            c.set_parameter(CParameter::EnableLongDistanceMatching(true)).map_err(err)?;
            c.set_parameter(CParameter::WindowLog(LONG_WINDOW_LOG)).map_err(err)?;
        }
        c.compress(data).map_err(err)
    }

    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let err = |e: io::Error| CodecError::Decompression(e.to_string());
        let mut d = zstd::bulk::Decompressor::new().map_err(err)?;
        d.set_parameter(DParameter::WindowLogMax(MAX_WINDOW_LOG)).map_err(err)?;
        d.decompress(data, expected_len).map_err(err)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve the codec for a block.  Zstd decoding ignores the level, so a
/// reader can pass any `ZstdCodec`.
pub fn get_codec(id: CodecId, zstd: ZstdCodec) -> Box<dyn Codec> {
    match id {
        CodecId::Stored => Box::new(StoredCodec),
        CodecId::Zstd   => Box::new(zstd),
    }
}
