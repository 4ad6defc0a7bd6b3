//! Public error taxonomy.
//!
//! Lower layers (`codec`, `container`) report failures without knowing which
//! file they were working on.  Everything that crosses the crate boundary is
//! an [`NszError`], and every variant names the offending file so a failure is
//! actionable on its own.

use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::container::FormatError;

pub type Result<T, E = NszError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum NszError {
    #[error("invalid parameter {name}: {message}")]
    InvalidParameter { name: &'static str, message: String },

    #[error("{}: malformed container at offset {offset:#x}: {message}", path.display())]
    MalformedContainer { path: PathBuf, offset: u64, message: String },

    #[error("{}: unrecognized metadata in {field}: {message}", path.display())]
    UnrecognizedMetadata { path: PathBuf, field: String, message: String },

    #[error("{}: corrupt block {block}: {reason}", path.display())]
    CorruptBlock { path: PathBuf, block: usize, reason: String },

    #[error("{}: checksum mismatch (expected {expected}, got {actual})", path.display())]
    ChecksumMismatch { path: PathBuf, expected: String, actual: String },

    #[error("{}: padding of region {region} does not reconstruct ({message})", path.display())]
    PaddingMismatch { path: PathBuf, region: String, message: String },

    #[error("{}: verification failed: {reason}{}", path.display(), locate(*offset, *block))]
    VerificationFailed {
        path:   PathBuf,
        reason: String,
        offset: Option<u64>,
        block:  Option<usize>,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("title {title_id:016x}: {} members rank identically", members.len())]
    AmbiguousContent { title_id: u64, members: Vec<PathBuf> },

    #[error("{}: cannot hard link to {}: {source}", path.display(), target.display())]
    LinkFailed {
        path:   PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}: cancelled", path.display())]
    Cancelled { path: PathBuf },
}

fn locate(offset: Option<u64>, block: Option<usize>) -> String {
    match (offset, block) {
        (Some(o), _)    => format!(" at offset {o:#x}"),
        (None, Some(b)) => format!(" in block {b}"),
        (None, None)    => String::new(),
    }
}

impl NszError {
    pub fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        NszError::InvalidParameter { name, message: message.into() }
    }

    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        NszError::Io { path: path.as_ref().to_owned(), source }
    }

    pub fn malformed(path: impl AsRef<Path>, err: FormatError) -> Self {
        match err {
            FormatError::Io(source) => NszError::io(path, source),
            FormatError::Structure { offset, message } => NszError::MalformedContainer {
                path: path.as_ref().to_owned(),
                offset,
                message,
            },
        }
    }

    pub fn corrupt(path: impl AsRef<Path>, block: usize, err: CodecError) -> Self {
        match err {
            CodecError::Io(source) => NszError::io(path, source),
            other => NszError::CorruptBlock {
                path:   path.as_ref().to_owned(),
                block,
                reason: other.to_string(),
            },
        }
    }

    pub fn verification(path: impl AsRef<Path>, reason: impl Into<String>, offset: Option<u64>) -> Self {
        NszError::VerificationFailed {
            path:   path.as_ref().to_owned(),
            reason: reason.into(),
            offset,
            block:  None,
        }
    }

    /// Path of the file the failure belongs to, when there is one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            NszError::InvalidParameter { .. } | NszError::AmbiguousContent { .. } => None,
            NszError::MalformedContainer { path, .. }
            | NszError::UnrecognizedMetadata { path, .. }
            | NszError::CorruptBlock { path, .. }
            | NszError::ChecksumMismatch { path, .. }
            | NszError::PaddingMismatch { path, .. }
            | NszError::VerificationFailed { path, .. }
            | NszError::Io { path, .. }
            | NszError::LinkFailed { path, .. }
            | NszError::Cancelled { path } => Some(path),
        }
    }

    /// Integrity failures are never tolerated and never retried.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            NszError::CorruptBlock { .. }
                | NszError::ChecksumMismatch { .. }
                | NszError::PaddingMismatch { .. }
                | NszError::VerificationFailed { .. }
        )
    }
}

const RETRY_PAUSE: Duration = Duration::from_millis(250);

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::PermissionDenied
    )
}

/// Run a filesystem operation, retrying once if the first failure looks
/// transient (a momentarily locked file, an interrupted call).
pub fn retry_io<T>(path: &Path, mut op: impl FnMut() -> io::Result<T>) -> Result<T> {
    match op() {
        Ok(v) => Ok(v),
        Err(e) if is_transient(&e) => {
            tracing::warn!(path = %path.display(), error = %e, "transient I/O failure, retrying once");
            thread::sleep(RETRY_PAUSE);
            op().map_err(|e| NszError::io(path, e))
        }
        Err(e) => Err(NszError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retry_io_retries_transient_once() {
        let calls = Cell::new(0);
        let out = retry_io(Path::new("x"), || {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Err(io::Error::new(io::ErrorKind::Interrupted, "busy"))
            } else {
                Ok(7)
            }
        });
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn retry_io_does_not_retry_not_found() {
        let calls = Cell::new(0);
        let out: Result<()> = retry_io(Path::new("missing"), || {
            calls.set(calls.get() + 1);
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
        });
        assert!(matches!(out, Err(NszError::Io { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn messages_carry_path_and_location() {
        let e = NszError::VerificationFailed {
            path:   PathBuf::from("game.nsz"),
            reason: "byte differs".into(),
            offset: Some(0x40),
            block:  None,
        };
        let msg = e.to_string();
        assert!(msg.contains("game.nsz"));
        assert!(msg.contains("0x40"));
        assert_eq!(e.path(), Some(Path::new("game.nsz")));
    }
}
