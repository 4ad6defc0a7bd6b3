use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::DecompressOptions;
use crate::container::FileKind;
use crate::error::{NszError, Result};
use crate::io_stream::{ArchiveReader, DecodeSettings};
use crate::ops::{output_path, run_batch, BatchReport, OutputClaims, PartFile};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecompressOutcome {
    pub output:   PathBuf,
    pub skipped:  bool,
    /// BLAKE3 of the reconstructed container.
    pub checksum: Option<String>,
}

/// Reconstruct the original container of one archive.
pub fn decompress(source: &Path, output_dir: Option<&Path>, opts: &DecompressOptions) -> Result<DecompressOutcome> {
    opts.parallelism.validate()?;
    decompress_one(source, output_dir, opts, &OutputClaims::default())
}

pub fn decompress_batch(sources: &[PathBuf], output_dir: Option<&Path>, opts: &DecompressOptions) -> Result<BatchReport<DecompressOutcome>> {
    opts.parallelism.validate()?;
    let claims = OutputClaims::default();
    Ok(run_batch(sources, opts.parallelism.multi, |p| decompress_one(p, output_dir, opts, &claims)))
}

fn decompress_one(source: &Path, output_dir: Option<&Path>, opts: &DecompressOptions, claims: &OutputClaims) -> Result<DecompressOutcome> {
    let format = match FileKind::require(source)? {
        FileKind::Archive(format) => format,
        FileKind::Container(_) => {
            return Err(NszError::invalid("source", format!("{} is not a compressed archive", source.display())));
        }
    };
    let output = output_path(source, output_dir, format.container_extension());
    let _claim = claims.claim(&output)?;
    if output.exists() && !opts.overwrite {
        tracing::info!(output = %output.display(), "output exists, skipping");
        return Ok(DecompressOutcome { output, skipped: true, checksum: None });
    }

    let mut reader = ArchiveReader::open(source)?;
    if reader.index.format != format {
        return Err(NszError::invalid("source", format!(
            "{} holds a {:?} container, not what its extension says",
            source.display(),
            reader.index.format
        )));
    }

    let (part, file) = PartFile::create(&output)?;
    let settings = DecodeSettings {
        strict_padding: opts.fix_padding,
        threads: opts.parallelism.threads.resolve(),
        cancel: &opts.cancel,
    };
    let part_path = part.path().to_owned();
    let (mut writer, checksum) = reader.decode_to(BufWriter::with_capacity(1 << 20, file), &part_path, &settings)?;
    writer.flush().map_err(|e| NszError::io(&part_path, e))?;
    let file = writer.into_inner().map_err(|e| NszError::io(&part_path, e.into_error()))?;
    file.sync_all().map_err(|e| NszError::io(&part_path, e))?;
    drop(file);
    part.commit()?;

    tracing::info!(source = %source.display(), output = %output.display(), "decompressed");
    Ok(DecompressOutcome { output, skipped: false, checksum: Some(checksum) })
}
