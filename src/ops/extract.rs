use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::archive::{entry_output_path, Archive};
use crate::container::{Container, FileKind};
use crate::error::{NszError, Result};
use crate::perf::CancelToken;

use super::{run_batch, BatchReport};

/// Write the entries matching `selector` from every source under
/// `output_dir/<source stem>/`.  A selector that matches nothing yields an
/// empty list for that source; a source that cannot be read fails alone.
pub fn extract(
    sources: &[PathBuf],
    output_dir: &Path,
    selector: &str,
    cancel: &CancelToken,
) -> Result<BatchReport<Vec<PathBuf>>> {
    let re = Regex::new(selector).map_err(|e| NszError::invalid("selector", e.to_string()))?;
    Ok(run_batch(sources, 1, |source| {
        let stem = source.file_stem().map(|s| s.to_os_string()).unwrap_or_default();
        let dest = output_dir.join(stem);
        match FileKind::require(source)? {
            FileKind::Archive(_) => Archive::open(source)?.extract(&re, &dest, cancel),
            FileKind::Container(format) => extract_container(&Container::open_as(source, format)?, &re, &dest, cancel),
        }
    }))
}

fn extract_container(container: &Container, re: &Regex, dest: &Path, cancel: &CancelToken) -> Result<Vec<PathBuf>> {
    let mut file = container.open_file()?;
    let mut out = Vec::new();
    for entry in &container.entries {
        if !re.is_match(&entry.name) {
            continue;
        }
        if cancel.is_cancelled() {
            return Err(NszError::Cancelled { path: container.path.clone() });
        }
        let Some(path) = entry_output_path(dest, &entry.name) else {
            tracing::warn!(entry = %entry.name, "skipping entry with an unsafe name");
            continue;
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| NszError::io(parent, e))?;
        }
        let mut reader = container.range_reader(&mut file, entry.offset, entry.length)?;
        let mut target = File::create(&path).map_err(|e| NszError::io(&path, e))?;
        io::copy(&mut reader, &mut target).map_err(|e| NszError::io(&path, e))?;
        out.push(path);
    }
    Ok(out)
}
