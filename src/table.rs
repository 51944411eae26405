//! Process-wide cache table: a fixed array of independently locked slots,
//! handle-based access by small integer index, and the diagnostics reports.
//!
//! Every public operation locks the target slot's mutex and delegates to the
//! inner methods on [`Cache`]; composite operations therefore never re-lock.
//! Mapping-topology changes (create, destroy, resize, merge, compact,
//! automatic extension) are restricted to the controller thread — the thread
//! that built the table.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread::{self, ThreadId};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::{CacheError, Result};
use crate::pool::block::{ObjectReadGuard, ObjectWriteGuard};
use crate::pool::layout::{
    self, blocktag_to_string, CACHE_HOMEOSTATIC, CACHE_POPULATE, CACHE_PRIVATE, CACHE_USE_MAPINFO,
    MAX_CACHES, MAX_TAGLIST_SIZE,
};
use crate::pool::mapinfo;
use crate::pool::Cache;
use crate::sys;

static TABLE: OnceLock<CacheTable> = OnceLock::new();

/// Machine-readable per-cache counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub name: String,
    pub n_blocks: usize,
    pub u_blocks: usize,
    pub n_objects: usize,
    pub block_size: usize,
    pub cache_size: usize,
    pub crc: u64,
    pub mode: u32,
}

/// The table itself. [`CacheTable::init`] yields the process-wide instance;
/// [`CacheTable::new`] builds a standalone one (tests, embedding).
pub struct CacheTable {
    slots: Vec<Mutex<Cache>>,
    controller: ThreadId,
}

impl Default for CacheTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheTable {
    /// Build a table of [`MAX_CACHES`] empty slots. The calling thread
    /// becomes the controller.
    pub fn new() -> CacheTable {
        CacheTable {
            slots: (0..MAX_CACHES).map(|i| Mutex::new(Cache::new(i))).collect(),
            controller: thread::current().id(),
        }
    }

    /// The process-wide table. Idempotent: the first call initializes, every
    /// later call returns the same instance.
    pub fn init() -> &'static CacheTable {
        TABLE.get_or_init(CacheTable::new)
    }

    fn slot(&self, index: usize) -> Result<&Mutex<Cache>> {
        self.slots.get(index).ok_or(CacheError::IndexRange {
            index,
            max: MAX_CACHES,
        })
    }

    fn is_controller(&self) -> bool {
        thread::current().id() == self.controller
    }

    fn controller_check(&self) -> Result<()> {
        if self.is_controller() {
            Ok(())
        } else {
            Err(CacheError::NotController)
        }
    }

    // --- Creation / destruction -----------------------------------------

    /// Declare one object of the cache at `index`. All objects must be
    /// declared before [`CacheTable::create`] finalizes the geometry.
    pub fn add_object(&self, desc: &str, size: usize, index: usize) -> Result<()> {
        let mut c = self.slot(index)?.lock();
        c.add_object(desc, size)
    }

    /// Create the cache at `index`: finalize geometry (or reuse the geometry
    /// loaded by [`CacheTable::read_mapinfo`] when `mode` carries
    /// [`CACHE_USE_MAPINFO`]), then map the backing file. Returns the region
    /// checksum when `want_crc`, else 0.
    ///
    /// With `want_crc`, reopening a backing file whose content no longer
    /// matches the recorded checksum returns [`CacheError::Corrupt`] after
    /// tearing the mapping back down.
    pub fn create(
        &self,
        mode: u32,
        name: &str,
        n_blocks: usize,
        want_crc: bool,
        index: usize,
    ) -> Result<u64> {
        self.controller_check()?;
        if name.is_empty() {
            return Err(CacheError::InvalidArgument {
                op: "create",
                reason: "empty cache name".to_string(),
            });
        }

        let mut c = self.slot(index)?.lock();
        if c.is_mapped() {
            return Err(CacheError::AlreadyMapped(index));
        }

        if mode & CACHE_USE_MAPINFO != 0 {
            if c.n_blocks == 0 || c.objects.is_empty() {
                return Err(CacheError::Inconsistent {
                    cache: index,
                    reason: "no mapinfo geometry loaded".to_string(),
                });
            }
            // Reusing a persisted geometry on a different machine type would
            // reinterpret the byte layout.
            if c.march != sys::march() {
                return Err(CacheError::ArchMismatch {
                    cache: index,
                    stored: c.march.clone(),
                    current: sys::march().to_string(),
                });
            }
            c.mode = mode;
        } else {
            let given = Path::new(name);
            let dir = match given.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let stem = given
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            if stem.is_empty() {
                return Err(CacheError::InvalidArgument {
                    op: "create",
                    reason: format!("cannot derive a cache name from '{name}'"),
                });
            }

            c.mode = mode;
            c.finalize_geometry(n_blocks)?;
            c.mmap_name = dir.join(format!("{stem}.mmc"));
            c.path = dir;
            c.name = stem;
        }

        c.map_backing(want_crc)
    }

    /// Unmap and reset the slot, optionally deleting the `.mmc`/`.map` pair.
    pub fn destroy(&self, delete_files: bool, index: usize) -> Result<()> {
        self.controller_check()?;
        let mut c = self.slot(index)?.lock();
        c.unmap(delete_files)?;
        c.reset();
        Ok(())
    }

    /// Shutdown sweep: destroy every live slot, keeping backing files.
    /// Individual unmap failures are logged, not propagated — the sweep
    /// always finishes.
    pub fn exit_all(&self) -> Result<()> {
        self.controller_check()?;
        for slot in &self.slots {
            let mut c = slot.lock();
            if c.is_mapped() || c.occupied() {
                if let Err(e) = c.unmap(false) {
                    log::warn!("cache {}: unmap failed during exit: {e}", c.index);
                }
                c.reset();
            }
        }
        Ok(())
    }

    // --- Topology --------------------------------------------------------

    /// Change the block count of a mapped cache. See [`Cache::resize`].
    pub fn resize(&self, n_blocks: usize, index: usize) -> Result<()> {
        self.controller_check()?;
        let mut c = self.slot(index)?.lock();
        c.resize(n_blocks)
    }

    /// Append every block of cache `idx2` to cache `idx1`, restamping the
    /// copied blocks with `tag`. Both caches must share architecture and
    /// block size. Cache `idx2` is left untouched. Returns the number of
    /// blocks merged.
    pub fn merge(&self, idx1: usize, idx2: usize, tag: u64) -> Result<usize> {
        self.controller_check()?;
        if idx1 == idx2 {
            return Err(CacheError::InvalidArgument {
                op: "merge",
                reason: "a cache cannot be merged with itself".to_string(),
            });
        }
        let s1 = self.slot(idx1)?;
        let s2 = self.slot(idx2)?;

        // Slot mutexes are always taken in index order.
        let (mut g1, g2);
        if idx1 < idx2 {
            g1 = s1.lock();
            g2 = s2.lock();
        } else {
            g2 = s2.lock();
            g1 = s1.lock();
        }
        let c1 = &mut *g1;
        let c2 = &*g2;

        if !c1.is_mapped() {
            return Err(CacheError::NotMapped(idx1));
        }
        if !c2.is_mapped() {
            return Err(CacheError::NotMapped(idx2));
        }
        if c1.march != c2.march {
            return Err(CacheError::ArchMismatch {
                cache: idx2,
                stored: c2.march.clone(),
                current: c1.march.clone(),
            });
        }
        if c1.block_size != c2.block_size {
            return Err(CacheError::InvalidArgument {
                op: "merge",
                reason: format!(
                    "block sizes differ ({} vs {})",
                    c1.block_size, c2.block_size
                ),
            });
        }

        let n1 = c1.n_blocks;
        c1.resize(n1 + c2.n_blocks)?;

        let r1 = c1.region.clone().ok_or(CacheError::NotMapped(idx1))?;
        let r2 = c2.region.clone().ok_or(CacheError::NotMapped(idx2))?;
        for i in 0..c2.n_blocks {
            let src = layout::block_range(c2.block_size, i);
            let dst = layout::block_range(c1.block_size, n1 + i);
            // Safety: both slot mutexes are held, the source and destination
            // ranges are whole blocks inside their respective mappings.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    r2.base_ptr().add(src.start),
                    r1.base_mut_ptr().add(dst.start),
                    c1.block_size,
                );
            }
            let mut meta = c2.blocks[i];
            meta.tag = tag;
            c1.blocks[n1 + i] = meta;
        }
        c1.u_blocks += c2.u_blocks;

        log::debug!(
            "merged cache {idx2} into {idx1}: {} blocks appended",
            c2.n_blocks
        );
        Ok(c2.n_blocks)
    }

    // --- Block lifecycle -------------------------------------------------

    /// Write `data` into one object of one block; `block == None` means "any
    /// free block", extending the pool when none is free (controller only).
    /// Returns the block index written. See [`Cache::add_block`].
    pub fn add_block(
        &self,
        data: &[u8],
        object: usize,
        block: Option<usize>,
        tag: u64,
        loaded: bool,
        index: usize,
    ) -> Result<usize> {
        let may_extend = self.is_controller();
        let mut c = self.slot(index)?.lock();
        c.add_block(data, object, block, tag, loaded, may_extend)
    }

    pub fn delete_block(&self, block: usize, index: usize) -> Result<bool> {
        let mut c = self.slot(index)?.lock();
        c.delete_block(block)
    }

    pub fn restore_block(&self, block: usize, index: usize) -> Result<bool> {
        let mut c = self.slot(index)?.lock();
        c.restore_block(block)
    }

    /// Evict by tag ([`layout::TAG_ALL`] evicts everything). Returns the
    /// count of blocks cleared.
    pub fn clear(&self, tag: u64, index: usize) -> Result<usize> {
        let mut c = self.slot(index)?.lock();
        Ok(c.clear(tag))
    }

    /// Defragment used blocks to the front; public caches shrink afterwards.
    /// Returns the count of blocks relocated.
    pub fn compact(&self, index: usize) -> Result<usize> {
        self.controller_check()?;
        let mut c = self.slot(index)?.lock();
        c.compact()
    }

    pub fn change_blocktag(&self, index: usize, from: u64, to: u64) -> Result<usize> {
        let mut c = self.slot(index)?.lock();
        Ok(c.change_blocktag(from, to))
    }

    // --- Object access ---------------------------------------------------

    /// Shared access to one object's bytes. The returned guard holds the
    /// block's read lock until dropped.
    pub fn object_read(&self, block: usize, object: usize, index: usize) -> Result<ObjectReadGuard> {
        let c = self.slot(index)?.lock();
        let range = c.object_range(block, object)?;
        let region = c.region.clone().ok_or(CacheError::NotMapped(index))?;
        let lock = c.locks[block].clone();
        let guard = lock.read_arc();
        drop(c);
        Ok(ObjectReadGuard::new(region, range, guard))
    }

    /// Exclusive access to one object's bytes. The returned guard holds the
    /// block's write lock until dropped.
    pub fn object_write(
        &self,
        block: usize,
        object: usize,
        index: usize,
    ) -> Result<ObjectWriteGuard> {
        let c = self.slot(index)?.lock();
        let range = c.object_range(block, object)?;
        let region = c.region.clone().ok_or(CacheError::NotMapped(index))?;
        let lock = c.locks[block].clone();
        let guard = lock.write_arc();
        drop(c);
        Ok(ObjectWriteGuard::new(region, range, guard))
    }

    // --- Per-field accessors ---------------------------------------------

    pub fn blocktag(&self, block: usize, index: usize) -> Result<u64> {
        let c = self.slot(index)?.lock();
        c.check_block(block)?;
        Ok(c.blocks[block].tag)
    }

    pub fn set_blocktag(&self, tag: u64, block: usize, index: usize) -> Result<()> {
        let mut c = self.slot(index)?.lock();
        c.check_block(block)?;
        c.blocks[block].tag = tag;
        Ok(())
    }

    pub fn blocklifetime(&self, block: usize, index: usize) -> Result<i64> {
        let c = self.slot(index)?.lock();
        c.check_block(block)?;
        Ok(c.blocks[block].lifetime)
    }

    pub fn set_blocklifetime(&self, lifetime: i64, block: usize, index: usize) -> Result<()> {
        let mut c = self.slot(index)?.lock();
        c.check_block(block)?;
        c.blocks[block].lifetime = lifetime;
        Ok(())
    }

    pub fn blockhubness(&self, block: usize, index: usize) -> Result<i64> {
        let c = self.slot(index)?.lock();
        c.check_block(block)?;
        Ok(c.blocks[block].hubness)
    }

    pub fn set_blockhubness(&self, hubness: i64, block: usize, index: usize) -> Result<()> {
        let mut c = self.slot(index)?.lock();
        c.check_block(block)?;
        c.blocks[block].hubness = hubness;
        Ok(())
    }

    pub fn blockbinding(&self, block: usize, index: usize) -> Result<i64> {
        let c = self.slot(index)?.lock();
        c.check_block(block)?;
        Ok(c.blocks[block].binding)
    }

    pub fn set_blockbinding(&self, binding: i64, block: usize, index: usize) -> Result<()> {
        let mut c = self.slot(index)?.lock();
        c.check_block(block)?;
        c.blocks[block].binding = binding;
        Ok(())
    }

    pub fn object_size(&self, object: usize, index: usize) -> Result<usize> {
        let c = self.slot(index)?.lock();
        c.check_object(object)?;
        Ok(c.objects[object].size)
    }

    pub fn auxinfo(&self, index: usize) -> Result<String> {
        Ok(self.slot(index)?.lock().auxinfo.clone())
    }

    pub fn set_auxinfo(&self, auxinfo: &str, index: usize) -> Result<()> {
        self.slot(index)?.lock().auxinfo = auxinfo.to_string();
        Ok(())
    }

    pub fn colsize(&self, index: usize) -> Result<u64> {
        Ok(self.slot(index)?.lock().colsize)
    }

    pub fn set_colsize(&self, colsize: u64, index: usize) -> Result<()> {
        self.slot(index)?.lock().colsize = colsize;
        Ok(())
    }

    // --- Queries ---------------------------------------------------------

    /// First slot whose name matches, or [`CacheError::NotFound`].
    pub fn name_to_index(&self, name: &str) -> Result<usize> {
        for (i, slot) in self.slots.iter().enumerate() {
            let c = slot.lock();
            if c.occupied() && c.name == name {
                return Ok(i);
            }
        }
        Err(CacheError::NotFound(name.to_string()))
    }

    pub fn is_mapped(&self, index: usize) -> Result<bool> {
        Ok(self.slot(index)?.lock().is_mapped())
    }

    /// Which cache, if any, contains the given address in its mapping.
    pub fn is_mapped_at(&self, addr: usize) -> Option<usize> {
        for (i, slot) in self.slots.iter().enumerate() {
            let c = slot.lock();
            if let Some(region) = &c.region {
                let base = region.base_ptr() as usize;
                if addr >= base && addr < base + region.len() {
                    return Some(i);
                }
            }
        }
        None
    }

    /// Whether the slot has a live mapping and allocated per-block state.
    pub fn is_allocated(&self, index: usize) -> Result<bool> {
        let c = self.slot(index)?.lock();
        Ok(c.is_mapped() && !c.blocks.is_empty())
    }

    pub fn block_in_use(&self, block: usize, index: usize) -> Result<bool> {
        let c = self.slot(index)?.lock();
        c.check_block(block)?;
        Ok(c.blocks[block].in_use())
    }

    /// Whether the block has been marked fully loaded.
    pub fn already_loaded(&self, block: usize, index: usize) -> Result<bool> {
        self.block_in_use(block, index)
    }

    /// Whether the slot is occupied (named), mapped or not.
    pub fn cache_in_use(&self, index: usize) -> Result<bool> {
        Ok(self.slot(index)?.lock().occupied())
    }

    pub fn is_busy(&self, index: usize) -> Result<bool> {
        Ok(self.slot(index)?.lock().busy)
    }

    /// Advisory busy flag; no automatic effect on any operation.
    pub fn set_busy(&self, busy: bool, index: usize) -> Result<()> {
        self.slot(index)?.lock().busy = busy;
        Ok(())
    }

    pub fn is_private(&self, index: usize) -> Result<bool> {
        Ok(self.slot(index)?.lock().mode & CACHE_PRIVATE != 0)
    }

    pub fn is_preloaded(&self, index: usize) -> Result<bool> {
        Ok(self.slot(index)?.lock().mode & CACHE_POPULATE != 0)
    }

    /// Flush the mapped region to its backing file.
    pub fn flush(&self, index: usize) -> Result<()> {
        let c = self.slot(index)?.lock();
        let region = c.region.clone().ok_or(CacheError::NotMapped(index))?;
        drop(c);
        region.flush()?;
        Ok(())
    }

    pub fn stats(&self, index: usize) -> Result<CacheStats> {
        let c = self.slot(index)?.lock();
        Ok(CacheStats {
            name: c.name.clone(),
            n_blocks: c.n_blocks,
            u_blocks: c.u_blocks,
            n_objects: c.objects.len(),
            block_size: c.block_size,
            cache_size: c.cache_size,
            crc: c.crc,
            mode: c.mode,
        })
    }

    // --- Persistence -----------------------------------------------------

    /// Serialize the cache's metadata to its `.map` companion. Returns the
    /// checksum written. See [`mapinfo::write_mapinfo`].
    pub fn write_mapinfo(
        &self,
        protect: bool,
        map_name: &str,
        mode: u32,
        index: usize,
    ) -> Result<u64> {
        let mut c = self.slot(index)?.lock();
        mapinfo::write_mapinfo(&mut c, protect, Path::new(map_name), mode)
    }

    /// Load geometry and per-block state from a `.map` file into an unmapped
    /// slot, ready for `create` with [`CACHE_USE_MAPINFO`]. Returns the
    /// checksum read.
    pub fn read_mapinfo(&self, map_name: &str, index: usize) -> Result<u64> {
        let mut c = self.slot(index)?.lock();
        if c.is_mapped() {
            return Err(CacheError::AlreadyMapped(index));
        }
        mapinfo::read_mapinfo(&mut c, Path::new(map_name))
    }

    // --- Diagnostics -----------------------------------------------------

    /// One line per occupied slot, then a mapped/available footer.
    pub fn display(&self, w: &mut dyn Write) -> Result<()> {
        let mut occupied = 0usize;
        let mut mapped = 0usize;
        for (i, slot) in self.slots.iter().enumerate() {
            let c = slot.lock();
            if !c.occupied() {
                continue;
            }
            occupied += 1;
            let addr = match &c.region {
                Some(r) => {
                    mapped += 1;
                    format!("{:p}", r.base_ptr())
                }
                None => "unmapped".to_string(),
            };
            writeln!(
                w,
                "{i:3}  {:<16} {:<24} {:>6} blocks  {:>10}  {addr}  [{}]",
                c.name,
                c.path.display(),
                c.n_blocks,
                sys::human_size(c.cache_size as u64),
                mode_summary(c.mode),
            )?;
        }
        writeln!(
            w,
            "{mapped} mapped, {} available",
            MAX_CACHES - occupied
        )?;
        Ok(())
    }

    /// Verbose dump of one cache: identity, checksum, paths, architecture,
    /// mode, geometry, and the per-object table.
    pub fn display_statistics(&self, w: &mut dyn Write, index: usize) -> Result<()> {
        let c = self.slot(index)?.lock();
        writeln!(w, "cache {index} '{}'", c.name)?;
        writeln!(w, "  crc         {:#018x}", c.crc)?;
        writeln!(w, "  path        {}", c.path.display())?;
        writeln!(w, "  mmap file   {}", c.mmap_name.display())?;
        writeln!(w, "  map file    {}", c.mapinfo_name.display())?;
        writeln!(w, "  march       {}", c.march)?;
        writeln!(w, "  auxinfo     {}", c.auxinfo)?;
        writeln!(w, "  mode        [{}]", mode_summary(c.mode))?;
        writeln!(w, "  blocks      {} ({} used)", c.n_blocks, c.u_blocks)?;
        writeln!(w, "  block size  {}", sys::human_size(c.block_size as u64))?;
        writeln!(w, "  cache size  {}", sys::human_size(c.cache_size as u64))?;
        writeln!(w, "  colsize     {}", c.colsize)?;
        writeln!(w, "  objects:")?;
        for (j, o) in c.objects.iter().enumerate() {
            writeln!(
                w,
                "    {j:3}  {:<16} offset {:>8}  size {}",
                o.desc,
                o.offset,
                sys::human_size(o.size as u64)
            )?;
        }
        Ok(())
    }

    /// Histogram of tags over the used blocks: one line per distinct tag,
    /// then a total. Overflows [`MAX_TAGLIST_SIZE`] as an error.
    pub fn show_blocktag_stats(&self, w: &mut dyn Write, index: usize) -> Result<()> {
        let c = self.slot(index)?.lock();

        let mut taglist: HashMap<u64, u64> = HashMap::new();
        for i in 0..c.n_blocks {
            let _r = c.locks[i].read();
            let b = &c.blocks[i];
            if !b.in_use() {
                continue;
            }
            *taglist.entry(b.tag).or_insert(0) += 1;
            if taglist.len() > MAX_TAGLIST_SIZE {
                return Err(CacheError::TaglistOverflow {
                    max: MAX_TAGLIST_SIZE,
                });
            }
        }
        drop(c);

        let mut tags: Vec<(u64, u64)> = taglist.into_iter().collect();
        tags.sort_unstable_by_key(|&(tag, _)| tag);
        for (tag, count) in &tags {
            writeln!(w, "  {:<12} {count} blocks", blocktag_to_string(*tag))?;
        }
        writeln!(w, "{} tags", tags.len())?;
        Ok(())
    }
}

/// Bracketed sharing/populate summary used by the reports.
fn mode_summary(mode: u32) -> String {
    let mut parts = vec![if mode & CACHE_PRIVATE != 0 {
        "private"
    } else {
        "public"
    }];
    if mode & CACHE_POPULATE != 0 {
        parts.push("populate");
    }
    if mode & CACHE_HOMEOSTATIC != 0 {
        parts.push("homeostatic");
    }
    parts.join(",")
}
