//! Cache pool core.
//!
//! One [`Cache`] is one slot of the process-wide table: a memory-mapped pool
//! of `n_blocks` fixed-size blocks, each subdivided into the declared
//! objects. All methods here assume the caller holds the slot's mutex — the
//! public locking wrappers live in [`crate::table`]. This is the safe-outer /
//! locked-inner split: composite operations (compact calling resize, merge
//! calling everything) chain the inner methods without re-locking.

pub mod block;
pub mod layout;
pub mod mapinfo;
pub mod region;

use std::fs::File;
use std::io;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{CacheError, Result};
use crate::sys;
use block::BlockMeta;
use layout::{
    ObjectSpec, ALLOC_QUANTUM, BLOCK_USED, CACHE_PRIVATE, MAX_CACHE_BLOCK_OBJECTS, TAG_ALL,
};
use region::Region;

/// One cache slot: identity, geometry, mapping state, per-block metadata.
#[derive(Debug)]
pub struct Cache {
    /// Own position in the table, carried for error context.
    pub(crate) index: usize,

    // Identity
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    pub(crate) march: String,
    pub(crate) mode: u32,

    // Geometry
    pub(crate) objects: Vec<ObjectSpec>,
    pub(crate) n_blocks: usize,
    pub(crate) block_size: usize,
    pub(crate) cache_size: usize,

    // Mapping state
    pub(crate) mmap_name: PathBuf,
    pub(crate) region: Option<Arc<Region>>,
    pub(crate) mapinfo_name: PathBuf,
    pub(crate) mapinfo: Option<File>,
    pub(crate) mapinfo_protected: bool,

    // Per-block state; `locks` is parallel to `blocks` and never persisted
    pub(crate) blocks: Vec<BlockMeta>,
    pub(crate) locks: Vec<Arc<RwLock<()>>>,

    // Bookkeeping
    pub(crate) u_blocks: usize,
    pub(crate) crc: u64,
    pub(crate) colsize: u64,
    pub(crate) auxinfo: String,
    pub(crate) busy: bool,
}

impl Cache {
    pub(crate) fn new(index: usize) -> Self {
        Cache {
            index,
            name: String::new(),
            path: PathBuf::new(),
            march: String::new(),
            mode: 0,
            objects: Vec::new(),
            n_blocks: 0,
            block_size: 0,
            cache_size: 0,
            mmap_name: PathBuf::new(),
            region: None,
            mapinfo_name: PathBuf::new(),
            mapinfo: None,
            mapinfo_protected: false,
            blocks: Vec::new(),
            locks: Vec::new(),
            u_blocks: 0,
            crc: 0,
            colsize: 0,
            auxinfo: String::new(),
            busy: false,
        }
    }

    /// Return the slot to its initial state. The mapping must already be
    /// gone (see [`Cache::unmap`]).
    pub(crate) fn reset(&mut self) {
        *self = Cache::new(self.index);
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.region.is_some()
    }

    /// The table's notion of "named/occupied" for display purposes.
    pub(crate) fn occupied(&self) -> bool {
        !self.name.is_empty()
    }

    pub(crate) fn check_block(&self, block: usize) -> Result<()> {
        if block >= self.n_blocks {
            return Err(CacheError::BlockRange {
                cache: self.index,
                index: block,
                n_blocks: self.n_blocks,
            });
        }
        Ok(())
    }

    pub(crate) fn check_object(&self, object: usize) -> Result<()> {
        if object >= self.objects.len() {
            return Err(CacheError::ObjectRange {
                cache: self.index,
                index: object,
                n_objects: self.objects.len(),
            });
        }
        Ok(())
    }

    /// Byte range of `(block, object)` within the mapped region.
    pub(crate) fn object_range(&self, block: usize, object: usize) -> Result<Range<usize>> {
        self.check_block(block)?;
        self.check_object(object)?;
        Ok(layout::object_range(
            self.block_size,
            block,
            &self.objects[object],
        ))
    }

    /// Declare one object. Must happen before geometry is finalized.
    pub(crate) fn add_object(&mut self, desc: &str, size: usize) -> Result<()> {
        if self.is_mapped() {
            return Err(CacheError::AlreadyMapped(self.index));
        }
        if size == 0 {
            return Err(CacheError::InvalidArgument {
                op: "add_object",
                reason: format!("object '{desc}' has zero size"),
            });
        }
        if self.objects.len() >= MAX_CACHE_BLOCK_OBJECTS {
            return Err(CacheError::TooManyObjects {
                cache: self.index,
                max: MAX_CACHE_BLOCK_OBJECTS,
            });
        }
        self.objects.push(ObjectSpec {
            desc: desc.to_string(),
            size,
            offset: 0,
        });
        Ok(())
    }

    /// Compute object offsets, block/cache sizes, and fresh per-block state
    /// for a newly created geometry.
    pub(crate) fn finalize_geometry(&mut self, n_blocks: usize) -> Result<()> {
        if self.objects.is_empty() {
            return Err(CacheError::InvalidArgument {
                op: "create",
                reason: "no objects declared".to_string(),
            });
        }
        if n_blocks == 0 {
            return Err(CacheError::InvalidArgument {
                op: "create",
                reason: "zero blocks requested".to_string(),
            });
        }
        self.block_size = layout::finalize_offsets(&mut self.objects);
        self.n_blocks = n_blocks;
        self.cache_size = n_blocks * self.block_size;
        self.alloc_block_state(n_blocks);
        self.march = sys::march().to_string();
        Ok(())
    }

    pub(crate) fn alloc_block_state(&mut self, n_blocks: usize) {
        self.blocks = vec![BlockMeta::default(); n_blocks];
        self.locks = (0..n_blocks).map(|_| Arc::new(RwLock::new(()))).collect();
        self.u_blocks = 0;
    }

    /// Map the backing file and, when `want_crc`, verify content integrity
    /// against the previously recorded checksum. On a mismatch the mapping
    /// is torn down before returning so the caller never sees a half-valid
    /// region.
    pub(crate) fn map_backing(&mut self, want_crc: bool) -> Result<u64> {
        let existed = self.mmap_name.exists();
        let region = Region::map(&self.mmap_name, self.mode, self.cache_size)?;

        let crc = if want_crc { region.checksum() } else { 0 };
        if want_crc && existed && self.crc != 0 && crc != 0 && crc != self.crc {
            let stored = self.crc;
            self.crc = 0;
            drop(region); // unmap, close, unlock
            return Err(CacheError::Corrupt {
                cache: self.index,
                stored,
                computed: crc,
            });
        }

        if want_crc {
            self.crc = crc;
        }
        self.region = Some(Arc::new(region));
        Ok(crc)
    }

    /// Drop the mapping (flushing it first) and optionally delete the
    /// backing pair of files.
    pub(crate) fn unmap(&mut self, delete_files: bool) -> Result<()> {
        if let Some(region) = self.region.take() {
            if delete_files {
                region.flush().ok();
                region.unlink()?;
            } else {
                region.flush()?;
            }
        }
        self.mapinfo = None; // releases homeostatic protection
        if delete_files && !self.mapinfo_name.as_os_str().is_empty() {
            match std::fs::remove_file(&self.mapinfo_name) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Change the block count. Grows the backing file (new blocks start
    /// unused/immortal and read as zero) or truncates it. The mapping may
    /// move; all offsets are recomputed from the new base on demand.
    ///
    /// Fails with [`CacheError::Busy`] while object guards are outstanding —
    /// remapping underneath a live guard would strand it on the old region.
    pub(crate) fn resize(&mut self, n_blocks: usize) -> Result<()> {
        if n_blocks == self.n_blocks {
            return Ok(());
        }
        if n_blocks == 0 {
            return Err(CacheError::InvalidArgument {
                op: "resize",
                reason: "zero blocks requested".to_string(),
            });
        }

        let region = self.region.take().ok_or(CacheError::NotMapped(self.index))?;
        let region = match Arc::try_unwrap(region) {
            Ok(r) => r,
            Err(shared) => {
                self.region = Some(shared);
                return Err(CacheError::Busy(self.index));
            }
        };

        // A remap failure leaves the slot unmapped but metadata-consistent.
        let new_size = n_blocks * self.block_size;
        let region = region.remap(new_size)?;
        self.region = Some(Arc::new(region));

        if n_blocks > self.n_blocks {
            for _ in self.n_blocks..n_blocks {
                self.blocks.push(BlockMeta::default());
                self.locks.push(Arc::new(RwLock::new(())));
            }
        } else {
            self.blocks.truncate(n_blocks);
            self.locks.truncate(n_blocks);
            self.u_blocks = self.blocks.iter().filter(|b| b.in_use()).count();
        }

        self.n_blocks = n_blocks;
        self.cache_size = new_size;
        log::debug!("cache {} resized to {} blocks", self.index, n_blocks);
        Ok(())
    }

    /// Write `data` into one object of one block. `block == None` picks the
    /// first unused block, extending the pool by [`ALLOC_QUANTUM`] when none
    /// is free (`may_extend` gates that — extension is a topology change).
    /// `loaded` marks the block used and stamps its tag; partial fills leave
    /// the flags alone so follow-up writes can land in the same block.
    /// Returns the block index actually written.
    pub(crate) fn add_block(
        &mut self,
        data: &[u8],
        object: usize,
        block: Option<usize>,
        tag: u64,
        loaded: bool,
        may_extend: bool,
    ) -> Result<usize> {
        if data.is_empty() {
            return Err(CacheError::InvalidArgument {
                op: "add_block",
                reason: "empty data".to_string(),
            });
        }
        if self.region.is_none() {
            return Err(CacheError::NotMapped(self.index));
        }
        self.check_object(object)?;
        let objsize = self.objects[object].size;
        if data.len() > objsize {
            return Err(CacheError::InvalidArgument {
                op: "add_block",
                reason: format!("{} bytes do not fit object of {objsize} bytes", data.len()),
            });
        }

        let target = match block {
            Some(i) => {
                self.check_block(i)?;
                i
            }
            None => match self.blocks.iter().position(|b| !b.in_use()) {
                Some(i) => i,
                None => {
                    if !may_extend {
                        return Err(CacheError::NotController);
                    }
                    let first_new = self.n_blocks;
                    self.resize(self.n_blocks + ALLOC_QUANTUM)?;
                    first_new
                }
            },
        };

        let region = self.region.clone().ok_or(CacheError::NotMapped(self.index))?;
        let range = layout::object_range(self.block_size, target, &self.objects[object]);
        {
            let _w = self.locks[target].write();
            // Safety: the block's write lock is held and the range lies
            // inside the mapping.
            unsafe {
                region.slice_mut(range)[..data.len()].copy_from_slice(data);
            }
        }

        if loaded {
            let meta = &mut self.blocks[target];
            if !meta.in_use() {
                meta.flags |= BLOCK_USED;
                self.u_blocks += 1;
            }
            meta.tag = tag;
        }

        Ok(target)
    }

    /// Soft-remove: clear the used flag. Idempotent; returns whether a
    /// change was made.
    pub(crate) fn delete_block(&mut self, block: usize) -> Result<bool> {
        self.check_block(block)?;
        let meta = &mut self.blocks[block];
        if !meta.in_use() {
            return Ok(false);
        }
        meta.flags &= !BLOCK_USED;
        self.u_blocks = self.u_blocks.saturating_sub(1);
        Ok(true)
    }

    /// Inverse of [`Cache::delete_block`].
    pub(crate) fn restore_block(&mut self, block: usize) -> Result<bool> {
        self.check_block(block)?;
        let meta = &mut self.blocks[block];
        if meta.in_use() {
            return Ok(false);
        }
        meta.flags |= BLOCK_USED;
        self.u_blocks += 1;
        Ok(true)
    }

    /// Evict blocks by tag ([`TAG_ALL`] sweeps everything), each under its
    /// own write lock. Only usage flags change; tags and object geometry
    /// survive. Returns the count cleared.
    pub(crate) fn clear(&mut self, tag: u64) -> usize {
        let mut cleared = 0;
        for i in 0..self.n_blocks {
            let _w = self.locks[i].write();
            let meta = &mut self.blocks[i];
            if !meta.in_use() {
                continue;
            }
            if tag != TAG_ALL && meta.tag != tag {
                continue;
            }
            meta.flags &= !BLOCK_USED;
            cleared += 1;
        }
        self.u_blocks = self.u_blocks.saturating_sub(cleared);
        cleared
    }

    /// Slide used blocks toward the front to close every gap, swapping the
    /// parallel metadata along with the content. Public caches then shrink
    /// to the smallest [`ALLOC_QUANTUM`] multiple covering the used prefix.
    /// Returns the count of blocks relocated.
    pub(crate) fn compact(&mut self) -> Result<usize> {
        let region = self.region.clone().ok_or(CacheError::NotMapped(self.index))?;

        let mut hole: Option<usize> = None;
        let mut moved = 0usize;
        for i in 0..self.n_blocks {
            if !self.blocks[i].in_use() {
                if hole.is_none() {
                    hole = Some(i);
                }
                continue;
            }
            let Some(h) = hole else { continue };

            let src = layout::block_range(self.block_size, i);
            let dst = layout::block_range(self.block_size, h);
            {
                let _src = self.locks[i].write();
                let _dst = self.locks[h].write();
                // Safety: both block write locks are held; the two ranges
                // are distinct whole blocks of the mapping.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        region.base_ptr().add(src.start),
                        region.base_mut_ptr().add(dst.start),
                        self.block_size,
                    );
                }
            }
            self.blocks.swap(h, i);
            self.locks.swap(h, i);
            moved += 1;
            // Everything in (h, i] is now unused, so the next hole is h+1.
            hole = Some(h + 1);
        }

        drop(region);

        if self.mode & CACHE_PRIVATE == 0 {
            let want = self.u_blocks.max(1);
            let target = want.div_ceil(ALLOC_QUANTUM) * ALLOC_QUANTUM;
            if target < self.n_blocks {
                self.resize(target)?;
            }
        }

        if moved > 0 {
            log::debug!("cache {}: compacted {moved} blocks", self.index);
        }
        Ok(moved)
    }

    /// Replace `from` with `to` in every block's tag, each under its own
    /// write lock. Returns the count changed.
    pub(crate) fn change_blocktag(&mut self, from: u64, to: u64) -> usize {
        let mut changed = 0;
        for i in 0..self.n_blocks {
            let _w = self.locks[i].write();
            if self.blocks[i].tag == from {
                self.blocks[i].tag = to;
                changed += 1;
            }
        }
        changed
    }
}
