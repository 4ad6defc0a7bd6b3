//! Lossless compression, verification and deduplication of console game
//! containers (NSP/XCI/NCA ⇄ NSZ/XCZ/NCZ).

pub mod error;
pub mod codec;
pub mod block;
pub mod superblock;
pub mod container;
pub mod crypto;
pub mod keys;
pub mod classify;
pub mod index;
pub mod padding;
pub mod perf;
pub mod config;
pub mod io_stream;
pub mod archive;
pub mod verify;
pub mod dedup;
pub mod ops;

pub use error::{NszError, Result};
pub use archive::Archive;
pub use config::{
    CodecParams, CompressOptions, Config, CreateOptions, DecompressOptions, Parallelism, RetentionPolicy, Threads,
    UndupeAction, UndupePolicy, VerifyMode, VerifyOptions, VerifyPolicy,
};
pub use classify::{CnmtPolicy, ContentUnit, UnitType};
pub use container::{Container, ContainerFormat};
pub use dedup::{undupe, UndupeReport};
pub use ops::compress::{compress, compress_batch, CompressOutcome};
pub use ops::create::create;
pub use ops::decompress::{decompress, decompress_batch, DecompressOutcome};
pub use ops::extract::extract;
pub use ops::{classify_batch, verify_batch, BatchReport};
pub use perf::CancelToken;
pub use verify::{verify, VerifyReport};
