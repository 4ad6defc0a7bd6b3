//! Worker pools and write-side plumbing.
//!
//! # Block pool
//!
//! [`BlockPool`] compresses or decodes a batch of independent blocks on up to
//! `threads` workers.  Every worker writes into its own slot of a
//! preallocated result array, so the output order is the input order no
//! matter which worker finishes first.  The caller writes the batch only
//! after every slot is filled.
//!
//! # File pool
//!
//! [`run_jobs`] runs one closure per input on up to `multi` workers and
//! returns the results in input order.
//!
//! Both fall back to sequential execution without the `parallel` feature.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::block::{decode_block, encode_block, BlockHeader, EncodedBlock};
use crate::codec::{CodecError, ZstdCodec};

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Cooperative cancellation flag, checked between blocks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self { Self::default() }

    pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst); }

    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

#[derive(Error, Debug)]
pub enum BlockJobError {
    #[error("cancelled")]
    Cancelled,
    #[error("block {index}: {source}")]
    Codec {
        index: usize,
        #[source]
        source: CodecError,
    },
}

// ── Block pool ───────────────────────────────────────────────────────────────

pub struct BlockPool {
    threads: usize,
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl BlockPool {
    /// A pool of `threads` workers; one thread means inline execution.
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        #[cfg(feature = "parallel")]
        {
            let pool = if threads > 1 {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("nsz-block-{i}"))
                    .build()
                    .map_err(|e| tracing::warn!(error = %e, "block pool unavailable, running inline"))
                    .ok()
            } else {
                None
            };
            Self { threads, pool }
        }
        #[cfg(not(feature = "parallel"))]
        {
            Self { threads }
        }
    }

    pub fn threads(&self) -> usize { self.threads }

    /// Run `f` for every index into a slot array and return the filled slots.
    fn fill_slots<T, F>(&self, count: usize, cancel: &CancelToken, f: F) -> Result<Vec<T>, BlockJobError>
    where
        T: Send,
        F: Fn(usize) -> Result<T, CodecError> + Sync + Send,
    {
        let job = |i: usize| -> Result<T, BlockJobError> {
            if cancel.is_cancelled() {
                return Err(BlockJobError::Cancelled);
            }
            f(i).map_err(|source| BlockJobError::Codec { index: i, source })
        };

        #[cfg(feature = "parallel")]
        {
            if let Some(pool) = &self.pool {
                use rayon::prelude::*;
                let mut slots: Vec<Option<Result<T, BlockJobError>>> = (0..count).map(|_| None).collect();
                pool.install(|| {
                    slots.par_iter_mut().enumerate().for_each(|(i, slot)| *slot = Some(job(i)));
                });
                return slots
                    .into_iter()
                    .map(|s| s.unwrap_or(Err(BlockJobError::Cancelled)))
                    .collect();
            }
        }

        (0..count).map(job).collect()
    }

    /// Compress `chunks`; results are in input order.
    pub fn encode(&self, chunks: &[&[u8]], codec: &ZstdCodec, cancel: &CancelToken) -> Result<Vec<EncodedBlock>, BlockJobError> {
        self.fill_slots(chunks.len(), cancel, |i| encode_block(chunks[i], codec, false))
    }

    /// Verify and decode `blocks`; results are in input order.
    pub fn decode(&self, blocks: &[(BlockHeader, Vec<u8>)], cancel: &CancelToken) -> Result<Vec<Vec<u8>>, BlockJobError> {
        self.fill_slots(blocks.len(), cancel, |i| decode_block(&blocks[i].0, &blocks[i].1))
    }
}

// ── File pool ────────────────────────────────────────────────────────────────

/// Apply `f` to every item on up to `multi` workers.  One item's failure is
/// its own result; siblings always run.
pub fn run_jobs<T, R, F>(items: Vec<T>, multi: usize, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        if multi > 1 && items.len() > 1 {
            use rayon::prelude::*;
            match rayon::ThreadPoolBuilder::new()
                .num_threads(multi)
                .thread_name(|i| format!("nsz-job-{i}"))
                .build()
            {
                Ok(pool) => return pool.install(|| items.into_par_iter().map(&f).collect()),
                Err(e) => tracing::warn!(error = %e, "job pool unavailable, running sequentially"),
            }
        }
    }
    #[cfg(not(feature = "parallel"))]
    let _ = multi;
    items.into_iter().map(f).collect()
}

// ── Position-tracking writer ─────────────────────────────────────────────────

/// Buffered writer that knows how many bytes it has accepted, so block
/// offsets can be recorded without seeking.
pub struct TrackedWriter<W: Write> {
    inner:    io::BufWriter<W>,
    position: u64,
}

impl<W: Write> TrackedWriter<W> {
    pub fn new(inner: W, start: u64) -> Self {
        Self { inner: io::BufWriter::with_capacity(1 << 20, inner), position: start }
    }

    pub fn position(&self) -> u64 { self.position }

    pub fn into_inner(self) -> io::Result<W> {
        self.inner.into_inner().map_err(|e| e.into_error())
    }
}

impl<W: Write + Seek> TrackedWriter<W> {
    /// Overwrite already-written bytes at `at` and return to the end.
    pub fn patch(&mut self, at: u64, bytes: &[u8]) -> io::Result<()> {
        self.inner.flush()?;
        let inner = self.inner.get_mut();
        inner.seek(SeekFrom::Start(at))?;
        inner.write_all(bytes)?;
        inner.seek(SeekFrom::Start(self.position))?;
        Ok(())
    }
}

impl TrackedWriter<File> {
    /// Drop everything written from `at` on.
    pub fn truncate(&mut self, at: u64) -> io::Result<()> {
        self.inner.flush()?;
        let file = self.inner.get_mut();
        file.set_len(at)?;
        file.seek(SeekFrom::Start(at))?;
        self.position = at;
        Ok(())
    }
}

impl<W: Write> Write for TrackedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
