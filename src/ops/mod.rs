//! File-level operations and the job plumbing they share.
//!
//! Every operation writes through a [`PartFile`]: output goes to
//! `<name>.part` and is renamed into place only on success, so a failed or
//! cancelled job never leaves a truncated archive behind.  Batch runs claim
//! each output path in [`OutputClaims`] before writing it.

pub mod compress;
pub mod create;
pub mod decompress;
pub mod extract;

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::archive::Archive;
use crate::classify::{classify_container, CnmtPolicy, ContentUnit};
use crate::config::VerifyOptions;
use crate::container::{Container, FileKind};
use crate::error::{retry_io, NszError, Result};
use crate::keys;
use crate::perf::run_jobs;
use crate::verify::{self, VerifyReport};

// ── Batch report ─────────────────────────────────────────────────────────────

/// Per-file results of a batch, in input order.  One file's failure never
/// stops its siblings.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub outcomes: Vec<(PathBuf, Result<T>)>,
}

impl<T> BatchReport<T> {
    pub fn succeeded(&self) -> impl Iterator<Item = (&Path, &T)> {
        self.outcomes.iter().filter_map(|(p, r)| r.as_ref().ok().map(|t| (p.as_path(), t)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&Path, &NszError)> {
        self.outcomes.iter().filter_map(|(p, r)| r.as_ref().err().map(|e| (p.as_path(), e)))
    }

    pub fn is_success(&self) -> bool { self.outcomes.iter().all(|(_, r)| r.is_ok()) }
}

pub(crate) fn run_batch<T, F>(sources: &[PathBuf], multi: usize, f: F) -> BatchReport<T>
where
    T: Send,
    F: Fn(&Path) -> Result<T> + Sync + Send,
{
    let outcomes = run_jobs(sources.to_vec(), multi, |p| {
        let r = f(&p);
        if let Err(e) = &r {
            tracing::error!(path = %p.display(), error = %e, "job failed");
        }
        (p, r)
    });
    BatchReport { outcomes }
}

// ── Output claims ────────────────────────────────────────────────────────────

/// Output paths currently being written by some job.
#[derive(Debug, Default, Clone)]
pub struct OutputClaims(Arc<Mutex<HashSet<PathBuf>>>);

/// Releases its path when dropped.
pub struct Claim {
    claims: OutputClaims,
    path:   PathBuf,
}

impl OutputClaims {
    pub fn claim(&self, path: &Path) -> Result<Claim> {
        if !self.0.lock().insert(path.to_owned()) {
            return Err(NszError::invalid("output", format!("{} is already being written by another job", path.display())));
        }
        Ok(Claim { claims: self.clone(), path: path.to_owned() })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.claims.0.lock().remove(&self.path);
    }
}

// ── Part files ───────────────────────────────────────────────────────────────

/// `<target>.part`, removed on drop unless committed.
pub struct PartFile {
    part:      PathBuf,
    target:    PathBuf,
    committed: bool,
}

impl PartFile {
    pub fn create(target: &Path) -> Result<(Self, File)> {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| NszError::io(parent, e))?;
        }
        let mut name: OsString = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".part");
        let part = target.with_file_name(name);
        let file = retry_io(&part, || File::create(&part))?;
        Ok((Self { part, target: target.to_owned(), committed: false }, file))
    }

    pub fn path(&self) -> &Path { &self.part }

    pub fn commit(mut self) -> Result<()> {
        if self.target.exists() {
            fs::remove_file(&self.target).map_err(|e| NszError::io(&self.target, e))?;
        }
        retry_io(&self.target, || fs::rename(&self.part, &self.target))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.part);
        }
    }
}

/// `<output_dir or source dir>/<source stem>.<extension>`.
pub fn output_path(source: &Path, output_dir: Option<&Path>, extension: &str) -> PathBuf {
    let name = source.with_extension(extension);
    match (output_dir, name.file_name()) {
        (Some(dir), Some(file)) => dir.join(file),
        _ => name,
    }
}

// ── Verify and classify batches ──────────────────────────────────────────────

pub fn verify_batch(sources: &[PathBuf], opts: &VerifyOptions) -> Result<BatchReport<VerifyReport>> {
    opts.parallelism.validate()?;
    if opts.original.is_some() && sources.len() > 1 {
        return Err(NszError::invalid("original", "an explicit original applies to a single archive"));
    }
    Ok(run_batch(sources, opts.parallelism.multi, |p| verify::verify(p, opts)))
}

/// Content units of each source, for external tooling.
pub fn classify_batch(sources: &[PathBuf], policy: CnmtPolicy, keys_file: Option<&Path>, multi: usize) -> Result<BatchReport<Vec<ContentUnit>>> {
    if multi == 0 {
        return Err(NszError::invalid("multi", "must be at least 1"));
    }
    let key = keys::resolve(keys_file)?;
    Ok(run_batch(sources, multi, |p| match FileKind::require(p)? {
        FileKind::Archive(_) => Ok(Archive::open(p)?.units()),
        FileKind::Container(format) => {
            let container = Container::open_as(p, format)?;
            let c = classify_container(&container, policy, key.as_ref())?;
            for e in &c.failures {
                tracing::warn!(error = %e, "unit not classified");
            }
            Ok(c.units)
        }
    }))
}
