//! Header key loading from a `name = hex` keys file.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{retry_io, NszError, Result};

pub const HEADER_KEY_NAME: &str = "header_key";

/// The 32-byte AES-XTS key that protects NCA headers.
#[derive(Clone, PartialEq, Eq)]
pub struct HeaderKey(pub [u8; 32]);

impl std::fmt::Debug for HeaderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HeaderKey(..)")
    }
}

impl HeaderKey {
    pub fn from_keys_str(content: &str) -> Result<Self> {
        let value = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_once('='))
            .find(|(name, _)| name.trim() == HEADER_KEY_NAME)
            .map(|(_, v)| v.trim())
            .ok_or_else(|| NszError::invalid("keys_file", "no header_key entry"))?;

        let bytes = hex::decode(value)
            .map_err(|e| NszError::invalid("keys_file", format!("header_key: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| NszError::invalid("keys_file", format!("header_key is {} bytes, expected 32", b.len())))?;
        Ok(HeaderKey(key))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = retry_io(path, || fs::read_to_string(path))?;
        Self::from_keys_str(&text)
    }
}

/// `$HOME/.switch/prod.keys`, when it exists.
pub fn default_keys_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"))?;
    let path = PathBuf::from(home).join(".switch").join("prod.keys");
    path.is_file().then_some(path)
}

/// Load from an explicit path, else from the default location.  Absence of
/// any keys file is not an error: encrypted headers then go unclassified.
pub fn resolve(explicit: Option<&Path>) -> Result<Option<HeaderKey>> {
    match explicit {
        Some(p) => HeaderKey::load(p).map(Some),
        None => match default_keys_path() {
            Some(p) => match HeaderKey::load(&p) {
                Ok(k) => Ok(Some(k)),
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "ignoring unusable default keys file");
                    Ok(None)
                }
            },
            None => Ok(None),
        },
    }
}
