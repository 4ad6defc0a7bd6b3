use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::CreateOptions;
use crate::container::pfs0::{self, FIXED_ALIGN, LEGACY_ALIGN};
use crate::container::{ContainerFormat, FileKind};
use crate::error::{retry_io, NszError, Result};
use crate::ops::PartFile;

/// Package loose files into a new NSP, in the order given.
pub fn create(output: &Path, sources: &[PathBuf], opts: &CreateOptions) -> Result<PathBuf> {
    if FileKind::of(output) != Some(FileKind::Container(ContainerFormat::Pfs0)) {
        return Err(NszError::invalid("output", format!("{} must have the .nsp extension", output.display())));
    }
    if sources.is_empty() {
        return Err(NszError::invalid("sources", "nothing to package"));
    }
    if output.exists() && !opts.overwrite {
        return Err(NszError::invalid("output", format!("{} already exists", output.display())));
    }

    let mut seen = HashSet::new();
    let mut files = Vec::with_capacity(sources.len());
    for src in sources {
        let name = src
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| NszError::invalid("sources", format!("{} has no usable file name", src.display())))?
            .to_string();
        if !seen.insert(name.clone()) {
            return Err(NszError::invalid("sources", format!("duplicate entry name {name}")));
        }
        let size = fs::metadata(src).map_err(|e| NszError::io(src, e))?.len();
        files.push((name, size));
    }

    let align = if opts.fix_padding { FIXED_ALIGN } else { LEGACY_ALIGN };
    let header = pfs0::encode_header(&files, align);

    let (part, file) = PartFile::create(output)?;
    let part_path = part.path().to_owned();
    let mut out = BufWriter::with_capacity(1 << 20, file);
    out.write_all(&header).map_err(|e| NszError::io(&part_path, e))?;
    for (src, (_, size)) in sources.iter().zip(&files) {
        let mut input = retry_io(src, || File::open(src))?;
        let copied = io::copy(&mut input, &mut out).map_err(|e| NszError::io(src, e))?;
        if copied != *size {
            return Err(NszError::io(src, io::Error::new(io::ErrorKind::UnexpectedEof, "file changed size while packaging")));
        }
    }
    let file = out.into_inner().map_err(|e| NszError::io(&part_path, e.into_error()))?;
    file.sync_all().map_err(|e| NszError::io(&part_path, e))?;
    drop(file);
    part.commit()?;

    tracing::info!(output = %output.display(), entries = files.len(), "created");
    Ok(output.to_owned())
}
