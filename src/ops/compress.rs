use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::classify::{classify_container, Classification};
use crate::config::{CompressOptions, RetentionPolicy, VerifyOptions};
use crate::container::{Container, FileKind};
use crate::error::{NszError, Result};
use crate::io_stream::{write_archive, CompressReport, EncodeSettings};
use crate::keys::{self, HeaderKey};
use crate::ops::{output_path, run_batch, BatchReport, OutputClaims, PartFile};
use crate::verify::{verify_archive, VerifyReport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompressOutcome {
    pub output:         PathBuf,
    /// The output already existed and `overwrite` was not set.
    pub skipped:        bool,
    #[serde(skip)]
    pub report:         Option<CompressReport>,
    pub verify:         Option<VerifyReport>,
    pub source_removed: bool,
}

/// Compress one container into `output_dir` (default: next to the source).
pub fn compress(source: &Path, output_dir: Option<&Path>, opts: &CompressOptions) -> Result<CompressOutcome> {
    opts.validate()?;
    let key = keys::resolve(opts.keys_file.as_deref())?;
    compress_one(source, output_dir, opts, key.as_ref(), &OutputClaims::default())
}

pub fn compress_batch(sources: &[PathBuf], output_dir: Option<&Path>, opts: &CompressOptions) -> Result<BatchReport<CompressOutcome>> {
    opts.validate()?;
    let key = keys::resolve(opts.keys_file.as_deref())?;
    let claims = OutputClaims::default();
    Ok(run_batch(sources, opts.parallelism.multi, |p| compress_one(p, output_dir, opts, key.as_ref(), &claims)))
}

fn classify_or_generic(container: &Container, opts: &CompressOptions, key: Option<&HeaderKey>) -> Classification {
    match classify_container(container, opts.cnmt, key) {
        Ok(c) => {
            for e in &c.failures {
                tracing::warn!(error = %e, "unit not classified, compressing it generically");
            }
            c
        }
        Err(e) => {
            tracing::warn!(error = %e, "classification failed, compressing generically");
            Classification::default()
        }
    }
}

fn compress_one(
    source: &Path,
    output_dir: Option<&Path>,
    opts: &CompressOptions,
    key: Option<&HeaderKey>,
    claims: &OutputClaims,
) -> Result<CompressOutcome> {
    let format = match FileKind::require(source)? {
        FileKind::Container(format) => format,
        FileKind::Archive(_) => {
            return Err(NszError::invalid("source", format!("{} is already compressed", source.display())));
        }
    };
    let output = output_path(source, output_dir, format.archive_extension());
    let _claim = claims.claim(&output)?;

    if output.exists() && !opts.overwrite {
        tracing::info!(output = %output.display(), "output exists, skipping");
        return Ok(CompressOutcome { output, skipped: true, report: None, verify: None, source_removed: false });
    }

    let container = Container::open_as(source, format)?;
    let classification = classify_or_generic(&container, opts, key);
    let settings = EncodeSettings {
        params: opts.params,
        fix_padding: opts.fix_padding,
        threads: opts.parallelism.threads.resolve(),
        cancel: &opts.cancel,
    };

    let (part, file) = PartFile::create(&output)?;
    let report = write_archive(&container, &classification, &settings, file, part.path())?;

    // Checked under the part name; a failure drops the part file and leaves
    // any earlier output in place.
    let verify = match opts.verify.mode() {
        Some(mode) => {
            let vopts = VerifyOptions {
                fix_padding: opts.fix_padding,
                mode,
                original: Some(source.to_owned()),
                parallelism: opts.parallelism,
                cancel: opts.cancel.clone(),
            };
            let mut checked = verify_archive(part.path(), &vopts)?;
            checked.path = output.clone();
            Some(checked)
        }
        None => None,
    };

    part.commit()?;
    tracing::info!(
        source = %source.display(),
        output = %output.display(),
        ratio = format_args!("{:.3}", report.archive_size as f64 / report.source_size.max(1) as f64),
        blocks = report.blocks,
        "compressed"
    );

    let mut source_removed = false;
    if opts.retention == RetentionPolicy::RemoveSource && verify.is_some() {
        fs::remove_file(source).map_err(|e| NszError::io(source, e))?;
        tracing::info!(source = %source.display(), "source removed");
        source_removed = true;
    }

    Ok(CompressOutcome { output, skipped: false, report: Some(report), verify, source_removed })
}
