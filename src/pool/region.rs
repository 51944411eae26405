//! Backing-store mapper: opens or creates the `.mmc` data file, takes an
//! exclusive advisory lock against concurrent mappers, and maps the file into
//! the process address space.
//!
//! Forward map handles an existing file; the inverse operation creates a file
//! sized to the requested region first. The umbrella [`Region::map`] picks one
//! based on whether the path exists.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use super::layout::{CACHE_POPULATE, CACHE_PRIVATE};
use crate::error::Result;
use crate::sys;

/// One mapped backing file. Owns the mapping, the file descriptor, and the
/// advisory lock; all three are released together when the region drops.
#[derive(Debug)]
pub struct Region {
    mmap: MmapMut,
    file: File,
    path: PathBuf,
    len: usize,
    mode: u32,
}

impl Region {
    /// Map the backing file at `path`: the inverse (create-and-size) path
    /// when the file does not exist, the forward path otherwise.
    pub(crate) fn map(path: &Path, mode: u32, len: usize) -> Result<Region> {
        if path.exists() {
            Self::forward_map(path, mode, len)
        } else {
            Self::inverse_map(path, mode, len)
        }
    }

    /// Map an existing backing file read-write.
    pub(crate) fn forward_map(path: &Path, mode: u32, len: usize) -> Result<Region> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        sys::lock_file_exclusive(&file, path)?;

        let have = file.metadata()?.len();
        if (have as usize) < len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "backing file {} is {have} bytes, expected at least {len}",
                    path.display()
                ),
            )
            .into());
        }

        Self::from_file(file, path, mode, len)
    }

    /// Create the backing file (mode 0600), size it, then map it — the
    /// inverse of the forward path. New bytes read as zero.
    pub(crate) fn inverse_map(path: &Path, mode: u32, len: usize) -> Result<Region> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let file = opts.open(path)?;
        sys::lock_file_exclusive(&file, path)?;
        sys::allocate(&file, len as u64)?;

        Self::from_file(file, path, mode, len)
    }

    fn from_file(file: File, path: &Path, mode: u32, len: usize) -> Result<Region> {
        let mut options = MmapOptions::new();
        options.len(len);

        // Safety: the file is exclusively locked and stays open in `self`
        // for the whole lifetime of the mapping.
        let mmap = unsafe {
            if mode & CACHE_PRIVATE != 0 {
                options.map_copy(&file)?
            } else {
                options.map_mut(&file)?
            }
        };

        if mode & CACHE_POPULATE != 0 {
            prefault(&mmap, path);
        }

        log::debug!(
            "mapped {} ({len} bytes, {})",
            path.display(),
            if mode & CACHE_PRIVATE != 0 {
                "private"
            } else {
                "public"
            }
        );

        Ok(Region {
            mmap,
            file,
            path: path.to_path_buf(),
            len,
            mode,
        })
    }

    /// Unmap, resize the backing file, and map it again at the new length.
    /// The file descriptor (and its advisory lock) is kept across the remap.
    pub(crate) fn remap(self, len: usize) -> Result<Region> {
        let Region {
            mmap,
            file,
            path,
            mode,
            ..
        } = self;
        drop(mmap); // unmap before truncating
        sys::allocate(&file, len as u64)?;
        log::debug!("remapped {} to {len} bytes", path.display());
        Self::from_file(file, &path, mode, len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base address of the mapping.
    pub fn base_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub(crate) fn base_mut_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// View a byte range of the mapping.
    ///
    /// # Safety
    /// `range` must lie within the mapping and the caller must hold at least
    /// a read lock on every block the range touches.
    pub(crate) unsafe fn slice(&self, range: Range<usize>) -> &[u8] {
        debug_assert!(range.end <= self.len);
        std::slice::from_raw_parts(self.base_ptr().add(range.start), range.len())
    }

    /// Mutable view of a byte range of the mapping.
    ///
    /// # Safety
    /// `range` must lie within the mapping and the caller must hold the
    /// write lock of every block the range touches.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, range: Range<usize>) -> &mut [u8] {
        debug_assert!(range.end <= self.len);
        std::slice::from_raw_parts_mut(self.base_mut_ptr().add(range.start), range.len())
    }

    /// Content digest of the whole mapped region.
    pub fn checksum(&self) -> u64 {
        sys::checksum(&self.mmap)
    }

    /// Flush outstanding modifications to the backing file.
    pub fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }

    /// Remove the backing file. The mapping itself stays valid until drop.
    pub(crate) fn unlink(&self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }
}

/// Touch every page of the mapping so later accesses do not fault.
fn prefault(mmap: &MmapMut, path: &Path) {
    log::trace!("reading mmap {} to populate page cache...", path.display());
    let mut dst = [0u8; 8096];
    for chunk in mmap.chunks(dst.len()) {
        dst[..chunk.len()].copy_from_slice(chunk);
    }
    std::hint::black_box(dst);
}
