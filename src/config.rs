//! Option structs for every operation.
//!
//! All options have usable defaults and can be loaded from a JSON file
//! ([`Config::load`]); the binary then overrides individual fields from its
//! flags.  Values are checked once, at job entry, by `validate`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::classify::CnmtPolicy;
use crate::codec::{self, ZstdCodec};
use crate::error::{retry_io, NszError, Result};
use crate::perf::CancelToken;

pub const DEFAULT_LEVEL: i32 = 18;
pub const DEFAULT_BLOCK_SIZE_EXPONENT: u8 = 20;
pub const BLOCK_SIZE_EXPONENT_RANGE: std::ops::RangeInclusive<u8> = 14..=32;
pub const DEFAULT_MULTI: usize = 4;

// ── Codec parameters ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecParams {
    pub level:               i32,
    pub block_size_exponent: u8,
    pub solid:               bool,
    pub long_distance_mode:  bool,
}

impl Default for CodecParams {
    fn default() -> Self {
        Self {
            level:               DEFAULT_LEVEL,
            block_size_exponent: DEFAULT_BLOCK_SIZE_EXPONENT,
            solid:               false,
            long_distance_mode:  false,
        }
    }
}

impl CodecParams {
    pub fn validate(&self) -> Result<()> {
        let levels = codec::level_range();
        if !levels.contains(&self.level) {
            return Err(NszError::invalid("level", format!(
                "{} is outside {}..={}", self.level, levels.start(), levels.end()
            )));
        }
        if !BLOCK_SIZE_EXPONENT_RANGE.contains(&self.block_size_exponent) {
            return Err(NszError::invalid("block_size_exponent", format!(
                "{} is outside {}..={}",
                self.block_size_exponent,
                BLOCK_SIZE_EXPONENT_RANGE.start(),
                BLOCK_SIZE_EXPONENT_RANGE.end()
            )));
        }
        Ok(())
    }

    pub fn block_size(&self) -> u64 {
        1u64 << self.block_size_exponent
    }

    pub fn codec(&self, workers: usize) -> ZstdCodec {
        ZstdCodec::new(self.level, self.long_distance_mode).with_workers(workers as u32)
    }
}

// ── Parallelism ──────────────────────────────────────────────────────────────

/// Intra-file worker count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Threads {
    /// Sized to the hardware.
    #[default]
    Auto,
    Fixed(usize),
}

impl Threads {
    pub fn resolve(self) -> usize {
        match self {
            Threads::Fixed(n) => n.max(1),
            Threads::Auto => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        }
    }
}

impl FromStr for Threads {
    type Err = NszError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Threads::Auto);
        }
        match s.parse::<usize>() {
            Ok(n) if n >= 1 => Ok(Threads::Fixed(n)),
            _ => Err(NszError::invalid("threads", format!("{s:?} is neither \"auto\" nor a positive count"))),
        }
    }
}

impl fmt::Display for Threads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threads::Auto => f.write_str("auto"),
            Threads::Fixed(n) => write!(f, "{n}"),
        }
    }
}

impl Serialize for Threads {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Threads::Auto => s.serialize_str("auto"),
            Threads::Fixed(n) => s.serialize_u64(*n as u64),
        }
    }
}

impl<'de> Deserialize<'de> for Threads {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(usize),
            Name(String),
        }
        match Raw::deserialize(d)? {
            Raw::Count(n) => Threads::from_str(&n.to_string()),
            Raw::Name(s) => Threads::from_str(&s),
        }
        .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parallelism {
    /// Files processed concurrently.
    pub multi:   usize,
    pub threads: Threads,
}

impl Default for Parallelism {
    fn default() -> Self {
        Self { multi: DEFAULT_MULTI, threads: Threads::Auto }
    }
}

impl Parallelism {
    pub fn validate(&self) -> Result<()> {
        if self.multi == 0 {
            return Err(NszError::invalid("multi", "must be at least 1"));
        }
        if self.threads == Threads::Fixed(0) {
            return Err(NszError::invalid("threads", "must be at least 1"));
        }
        Ok(())
    }
}

// ── Policies ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    #[default]
    Quick,
    Full,
}

/// Verification after compressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyPolicy {
    #[default]
    None,
    Quick,
    Full,
}

impl VerifyPolicy {
    pub fn mode(self) -> Option<VerifyMode> {
        match self {
            VerifyPolicy::None  => None,
            VerifyPolicy::Quick => Some(VerifyMode::Quick),
            VerifyPolicy::Full  => Some(VerifyMode::Full),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Keep,
    /// Delete the source once the archive has been verified.
    RemoveSource,
}

// ── Per-operation options ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressOptions {
    pub params:      CodecParams,
    pub parallelism: Parallelism,
    pub fix_padding: bool,
    pub cnmt:        CnmtPolicy,
    pub verify:      VerifyPolicy,
    pub retention:   RetentionPolicy,
    pub overwrite:   bool,
    pub keys_file:   Option<PathBuf>,
    #[serde(skip)]
    pub cancel:      CancelToken,
}

impl CompressOptions {
    pub fn validate(&self) -> Result<()> {
        self.params.validate()?;
        self.parallelism.validate()?;
        if self.retention == RetentionPolicy::RemoveSource && self.verify == VerifyPolicy::None {
            return Err(NszError::invalid("retention", "removing the source requires a verify policy"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompressOptions {
    /// Check padding records strictly while regenerating them.
    pub fix_padding: bool,
    pub parallelism: Parallelism,
    pub overwrite:   bool,
    #[serde(skip)]
    pub cancel:      CancelToken,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyOptions {
    pub fix_padding: bool,
    pub mode:        VerifyMode,
    /// Original container to compare against; defaults to the sibling file
    /// with the container extension.
    pub original:    Option<PathBuf>,
    pub parallelism: Parallelism,
    #[serde(skip)]
    pub cancel:      CancelToken,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateOptions {
    /// Align the header to 0x20 instead of the legacy 0x10.
    pub fix_padding: bool,
    pub overwrite:   bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndupeAction {
    #[default]
    Report,
    Remove,
    Hardlink,
    Rename,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Identical ranks are reported and the group is skipped.
    #[default]
    Refuse,
    /// Identical ranks are resolved by lexicographic path order.
    PathOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UndupePolicy {
    /// Group across versions so superseded versions are found.
    pub old_versions: bool,
    /// Regexes over file names, earliest match ranks highest.
    pub priority:     Vec<String>,
    pub whitelist:    Vec<String>,
    pub blacklist:    Vec<String>,
    pub action:       UndupeAction,
    pub dry_run:      bool,
    pub tie_break:    TieBreak,
    pub cnmt:         CnmtPolicy,
    pub keys_file:    Option<PathBuf>,
    pub multi:        usize,
}

impl Default for UndupePolicy {
    fn default() -> Self {
        Self {
            old_versions: false,
            priority:     Vec::new(),
            whitelist:    Vec::new(),
            blacklist:    Vec::new(),
            action:       UndupeAction::Report,
            dry_run:      false,
            tie_break:    TieBreak::Refuse,
            cnmt:         CnmtPolicy::OnDemand,
            keys_file:    None,
            multi:        DEFAULT_MULTI,
        }
    }
}

// ── File config ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub compress:   CompressOptions,
    pub decompress: DecompressOptions,
    pub verify:     VerifyOptions,
    pub create:     CreateOptions,
    pub undupe:     UndupePolicy,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = retry_io(path, || fs::read_to_string(path))?;
        serde_json::from_str(&text)
            .map_err(|e| NszError::invalid("config", format!("{}: {e}", path.display())))
    }
}
