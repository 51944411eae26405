//! System-facing collaborators: the checksum oracle, machine architecture
//! identity, advisory whole-file locking, and backing-file allocation.
//!
//! The cache core treats all of these as opaque services; everything else in
//! the crate goes through this module rather than calling the platform
//! directly.

use std::fs::File;
use std::io;
use std::path::Path;

use fs2::FileExt;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{CacheError, Result};

/// 64-bit content digest over an arbitrary byte range.
pub fn checksum(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// Architecture identity recorded in cache metadata at creation time and
/// checked when an existing cache is re-opened for mapping.
pub fn march() -> &'static str {
    std::env::consts::ARCH
}

/// Non-blocking exclusive advisory lock over the whole file.
///
/// Contention is surfaced as [`CacheError::Locked`] so callers can tell
/// "someone else has this cache" apart from a plain open failure.
pub fn lock_file_exclusive(file: &File, path: &Path) -> Result<()> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(CacheError::Locked {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Size the backing file to exactly `len` bytes.
///
/// Growth reserves space (fallocate where the platform supports it), shrink
/// truncates. New bytes read as zero.
pub fn allocate(file: &File, len: u64) -> io::Result<()> {
    if file.metadata()?.len() > len {
        file.set_len(len)
    } else {
        file.allocate(len)
    }
}

/// Human-scaled byte size for diagnostics output.
pub fn human_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    let b = bytes as f64;
    if b < KB {
        format!("{bytes} B")
    } else if b < MB {
        format!("{:.1} KB", b / KB)
    } else if b < GB {
        format!("{:.1} MB", b / MB)
    } else {
        format!("{:.2} GB", b / GB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_and_input_sensitive() {
        let a = checksum(b"hello");
        assert_eq!(a, checksum(b"hello"));
        assert_ne!(a, checksum(b"hellp"));
        assert_ne!(checksum(b""), checksum(b"\0"));
    }

    #[test]
    fn march_is_nonempty() {
        assert!(!march().is_empty());
    }

    #[test]
    fn human_size_scaling() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn exclusive_lock_blocks_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        let f1 = File::create(&path).unwrap();
        let f2 = File::options().write(true).open(&path).unwrap();

        lock_file_exclusive(&f1, &path).unwrap();
        match lock_file_exclusive(&f2, &path) {
            Err(CacheError::Locked { .. }) => {}
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[test]
    fn allocate_grows_and_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alloc");
        let f = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();

        allocate(&f, 4096).unwrap();
        assert_eq!(f.metadata().unwrap().len(), 4096);
        allocate(&f, 1024).unwrap();
        assert_eq!(f.metadata().unwrap().len(), 1024);
    }
}
