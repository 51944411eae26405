//! Geometry of a cache pool: a block is a fixed-size unit repeated
//! `n_blocks` times in the mapped region, and every block is subdivided into
//! the same sequence of named objects. All byte offsets are computed from the
//! declared object table; nothing is stored as a raw address, so offsets stay
//! valid across a remap.

use std::ops::Range;

/// Capacity of the process-wide cache table.
pub const MAX_CACHES: usize = 64;

/// Maximum number of objects declared per block.
pub const MAX_CACHE_BLOCK_OBJECTS: usize = 32;

/// Maximum number of distinct tags one statistics scan may encounter.
pub const MAX_TAGLIST_SIZE: usize = 256;

/// Blocks added per automatic extension, and the shrink granularity after
/// compaction.
pub const ALLOC_QUANTUM: usize = 8;

/// Per-block occupancy bit in [`BlockMeta::flags`](super::block::BlockMeta).
pub const BLOCK_USED: u8 = 0x01;

/// Lifetime sentinel: the block never expires.
pub const BLOCK_IMMORTAL: i64 = -1;

/// Conventional scratch tag, rendered as `"scratch"` in diagnostics.
pub const TAG_SCRATCH: u64 = 0;

/// Tag sentinel addressing every block, rendered as `"all"`.
pub const TAG_ALL: u64 = u64::MAX;

/// Copy-on-write mapping, private to this process. Absent means a shared
/// mapping visible to every mapper of the backing file.
pub const CACHE_PRIVATE: u32 = 1 << 0;

/// Pre-fault all pages at map time.
pub const CACHE_POPULATE: u32 = 1 << 1;

/// Keep the mapinfo descriptor open under homeostatic protection.
pub const CACHE_HOMEOSTATIC: u32 = 1 << 2;

/// Reuse geometry loaded by `read_mapinfo` instead of recomputing it.
pub const CACHE_USE_MAPINFO: u32 = 1 << 3;

/// Format version written as the first field of every `.map` stream.
pub const MAPINFO_VERSION: u32 = 1;

/// One named sub-region of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSpec {
    pub desc: String,
    pub size: usize,
    /// Byte offset from the start of the containing block; the running sum
    /// of all previously declared object sizes.
    pub offset: usize,
}

/// Assign each object's offset as the running sum of the declared sizes.
/// Returns the resulting block size.
pub fn finalize_offsets(objects: &mut [ObjectSpec]) -> usize {
    let mut off = 0;
    for o in objects.iter_mut() {
        o.offset = off;
        off += o.size;
    }
    off
}

/// Byte range of one whole block within the mapped region.
pub fn block_range(block_size: usize, block: usize) -> Range<usize> {
    let start = block * block_size;
    start..start + block_size
}

/// Byte range of one object within one block.
pub fn object_range(block_size: usize, block: usize, spec: &ObjectSpec) -> Range<usize> {
    let start = block * block_size + spec.offset;
    start..start + spec.size
}

/// Render a tag for diagnostics: `"all"`, `"scratch"`, or a hex literal.
pub fn blocktag_to_string(tag: u64) -> String {
    match tag {
        TAG_ALL => "all".to_string(),
        TAG_SCRATCH => "scratch".to_string(),
        _ => format!("{tag:#x}"),
    }
}
