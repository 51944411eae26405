//! Memory-mapped, multi-block, multi-object cache engine.
//!
//! A process-wide table of cache slots, each mapping a pool of fixed-size
//! blocks inside one backing file. Every block is subdivided into the same
//! sequence of named objects; block and object addresses are byte offsets
//! computed from the declared object table, never stored pointers. A
//! companion `.map` file persists geometry and per-block state across
//! restarts, and an advisory whole-file lock keeps two mappers off the same
//! backing file.
//!
//! Concurrency: one mutex per cache slot guards metadata; one read/write
//! lock per block guards that block's object storage. Object access hands
//! out RAII guards that release on drop.

mod archive;
mod error;
mod pool;
mod sys;
mod table;

pub use archive::{archive, extract};
pub use error::{CacheError, Result};
pub use pool::block::{BlockMeta, ObjectReadGuard, ObjectWriteGuard};
pub use pool::layout::{
    blocktag_to_string, ObjectSpec, ALLOC_QUANTUM, BLOCK_IMMORTAL, BLOCK_USED, CACHE_HOMEOSTATIC,
    CACHE_POPULATE, CACHE_PRIVATE, CACHE_USE_MAPINFO, MAPINFO_VERSION, MAX_CACHES,
    MAX_CACHE_BLOCK_OBJECTS, MAX_TAGLIST_SIZE, TAG_ALL, TAG_SCRATCH,
};
pub use sys::{checksum, march};
pub use table::{CacheStats, CacheTable};
