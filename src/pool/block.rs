//! Per-block metadata and the RAII object guards.
//!
//! A guard owns the block's read/write lock and a handle on the mapped
//! region, and derefs to the object's byte slice. Dropping the guard releases
//! the lock; there is no manual unlock protocol. Because the guard keeps the
//! region alive, a stale guard taken before a resize keeps reading the old
//! mapping instead of dangling.

use std::ops::{Deref, DerefMut, Range};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use super::layout::{BLOCK_IMMORTAL, BLOCK_USED, TAG_SCRATCH};
use super::region::Region;

pub(crate) type BlockReadLock = ArcRwLockReadGuard<RawRwLock, ()>;
pub(crate) type BlockWriteLock = ArcRwLockWriteGuard<RawRwLock, ()>;

/// Metadata carried by every block, persisted in the mapinfo stream.
/// The block's rwlock lives beside this in a parallel array and is never
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMeta {
    /// Bit [`BLOCK_USED`] marks occupancy.
    pub flags: u8,
    /// Grouping identifier for bulk clear/merge/change operations.
    pub tag: u64,
    /// Signed lifetime; [`BLOCK_IMMORTAL`] never expires.
    pub lifetime: i64,
    /// Usage-weight metric, interpreted by higher layers only.
    pub hubness: i64,
    /// Affinity/owner metric, interpreted by higher layers only.
    pub binding: i64,
}

impl Default for BlockMeta {
    fn default() -> Self {
        BlockMeta {
            flags: 0,
            tag: TAG_SCRATCH,
            lifetime: BLOCK_IMMORTAL,
            hubness: 0,
            binding: 0,
        }
    }
}

impl BlockMeta {
    pub fn in_use(&self) -> bool {
        self.flags & BLOCK_USED != 0
    }
}

/// Shared view of one object's bytes. Holds the block's read lock.
pub struct ObjectReadGuard {
    region: Arc<Region>,
    range: Range<usize>,
    _lock: BlockReadLock,
}

impl ObjectReadGuard {
    pub(crate) fn new(region: Arc<Region>, range: Range<usize>, lock: BlockReadLock) -> Self {
        ObjectReadGuard {
            region,
            range,
            _lock: lock,
        }
    }
}

impl Deref for ObjectReadGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safety: the read lock of the containing block is held and the
        // range was validated against the geometry at construction.
        unsafe { self.region.slice(self.range.clone()) }
    }
}

/// Exclusive view of one object's bytes. Holds the block's write lock.
pub struct ObjectWriteGuard {
    region: Arc<Region>,
    range: Range<usize>,
    _lock: BlockWriteLock,
}

impl ObjectWriteGuard {
    pub(crate) fn new(region: Arc<Region>, range: Range<usize>, lock: BlockWriteLock) -> Self {
        ObjectWriteGuard {
            region,
            range,
            _lock: lock,
        }
    }
}

impl Deref for ObjectWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safety: the write lock of the containing block is held.
        unsafe { self.region.slice(self.range.clone()) }
    }
}

impl DerefMut for ObjectWriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safety: the write lock of the containing block is held, so this is
        // the only live view of these bytes.
        unsafe { self.region.slice_mut(self.range.clone()) }
    }
}
