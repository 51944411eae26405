//! Error taxonomy of the cache engine.
//!
//! Every operation returns a typed error instead of aborting: misuse
//! (`IndexRange`, `InvalidArgument`, ...) signals a programming error at the
//! call site, while `Locked` and `Corrupt` are recoverable conditions the
//! caller is expected to react to (retry/backoff, erase-and-recreate).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache index {index} out of range (table holds {max} slots)")]
    IndexRange { index: usize, max: usize },

    #[error("block index {index} out of range for cache {cache} ({n_blocks} blocks)")]
    BlockRange {
        cache: usize,
        index: usize,
        n_blocks: usize,
    },

    #[error("object index {index} out of range for cache {cache} ({n_objects} objects)")]
    ObjectRange {
        cache: usize,
        index: usize,
        n_objects: usize,
    },

    #[error("invalid argument for {op}: {reason}")]
    InvalidArgument { op: &'static str, reason: String },

    #[error("cache {0} is already mapped")]
    AlreadyMapped(usize),

    #[error("cache {0} is not mapped")]
    NotMapped(usize),

    #[error("cache {cache}: object table is full ({max} objects per block)")]
    TooManyObjects { cache: usize, max: usize },

    #[error("cache {cache} was created on '{stored}' but this machine is '{current}'")]
    ArchMismatch {
        cache: usize,
        stored: String,
        current: String,
    },

    #[error("cache {cache}: checksum mismatch (stored {stored:#018x}, computed {computed:#018x})")]
    Corrupt {
        cache: usize,
        stored: u64,
        computed: u64,
    },

    #[error("cache {cache}: inconsistent metadata: {reason}")]
    Inconsistent { cache: usize, reason: String },

    #[error("backing file {path} is locked by another mapper")]
    Locked { path: PathBuf },

    #[error("no cache named '{0}'")]
    NotFound(String),

    #[error("mapping operations are restricted to the controller thread")]
    NotController,

    #[error("cache {0} has outstanding block guards")]
    Busy(usize),

    #[error("taglist overflow: more than {max} distinct tags in one cache")]
    TaglistOverflow { max: usize },

    #[error("mapinfo format version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("archive: {0}")]
    Archive(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
