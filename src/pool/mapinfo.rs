//! Map-info persistence: the companion `.map` file holding a cache's
//! geometry and per-block state.
//!
//! The stream is a flat concatenation of little-endian fixed-width fields
//! and u32-length-prefixed UTF-8 strings, read and written in one fixed
//! order. A version word leads the stream; readers reject anything else.
//! Block rwlocks are never persisted — they are recreated fresh on read.

use std::fs::OpenOptions;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::block::BlockMeta;
use super::layout::{ObjectSpec, MAPINFO_VERSION, MAX_CACHE_BLOCK_OBJECTS};
use super::Cache;
use crate::error::{CacheError, Result};

/// Upper bound on any serialized string, to bound allocations when reading
/// a damaged stream.
const MAX_STRING: usize = 1 << 20;

/// Derive the `.map` path from any of the pair's spellings
/// (`demo`, `demo.map`, `dir/demo.mmc` all name `dir/demo.map`).
pub(crate) fn mapinfo_path(name: &Path) -> PathBuf {
    let dir = match name.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join(format!("{stem}.map"))
}

/// Serialize `cache` metadata, flushing a fresh checksum first, into the
/// derived `.map` file. Returns the checksum written.
///
/// Homeostatic protection: only the first writer after a fresh read keeps
/// the descriptor open; later writers open and close normally.
pub(crate) fn write_mapinfo(
    cache: &mut Cache,
    protect: bool,
    map_name: &Path,
    mode: u32,
) -> Result<u64> {
    let region = cache
        .region
        .clone()
        .ok_or(CacheError::NotMapped(cache.index))?;

    let path = mapinfo_path(map_name);
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;

    if protect && !cache.mapinfo_protected {
        cache.mapinfo = Some(file.try_clone()?);
        cache.mapinfo_protected = true;
    }

    cache.crc = region.checksum();
    cache.mapinfo_name = path.clone();

    let mut w = BufWriter::new(file);
    serialize_into(cache, mode, &mut w)?;
    w.flush()?;

    log::debug!(
        "cache {}: wrote mapinfo {} (crc {:#018x})",
        cache.index,
        path.display(),
        cache.crc
    );
    Ok(cache.crc)
}

/// Deserialize the `.map` file into `cache`, reallocating all per-block
/// state. Returns the checksum read.
pub(crate) fn read_mapinfo(cache: &mut Cache, map_name: &Path) -> Result<u64> {
    let path = mapinfo_path(map_name);
    let file = OpenOptions::new().read(true).open(&path)?;
    let mut r = BufReader::new(file);

    let crc = deserialize_from(cache, &mut r)?;

    cache.mapinfo = None;
    cache.mapinfo_protected = false;
    cache.mapinfo_name = path.clone();

    log::debug!(
        "cache {}: read mapinfo {} ({} blocks, crc {crc:#018x})",
        cache.index,
        path.display(),
        cache.n_blocks
    );
    Ok(crc)
}

/// Field order is the wire format; `deserialize_from` mirrors it exactly.
pub(crate) fn serialize_into<W: Write>(cache: &Cache, mode: u32, w: &mut W) -> io::Result<()> {
    put_u32(w, MAPINFO_VERSION)?;
    put_u64(w, cache.crc)?;
    put_str(w, &cache.path.to_string_lossy())?;
    put_str(w, &cache.name)?;
    put_str(w, &cache.mapinfo_name.to_string_lossy())?;
    put_str(w, &cache.mmap_name.to_string_lossy())?;
    put_str(w, &cache.march)?;
    put_str(w, &cache.auxinfo)?;
    put_u32(w, mode)?;
    put_u64(w, cache.u_blocks as u64)?;
    put_u64(w, cache.n_blocks as u64)?;
    put_u64(w, cache.objects.len() as u64)?;
    put_u64(w, cache.cache_size as u64)?;
    put_u64(w, cache.block_size as u64)?;
    put_u64(w, cache.colsize)?;

    for o in &cache.objects {
        put_str(w, &o.desc)?;
        put_u64(w, o.offset as u64)?;
        put_u64(w, o.size as u64)?;
    }

    for b in &cache.blocks {
        put_u8(w, b.flags)?;
        put_u64(w, b.tag)?;
        put_i64(w, b.lifetime)?;
        put_i64(w, b.hubness)?;
        put_i64(w, b.binding)?;
    }

    Ok(())
}

pub(crate) fn deserialize_from<R: Read>(cache: &mut Cache, r: &mut R) -> Result<u64> {
    let version = get_u32(r)?;
    if version != MAPINFO_VERSION {
        return Err(CacheError::UnsupportedVersion {
            found: version,
            expected: MAPINFO_VERSION,
        });
    }

    let crc = get_u64(r)?;
    cache.path = PathBuf::from(get_str(r)?);
    cache.name = get_str(r)?;
    let mapinfo_name = PathBuf::from(get_str(r)?);
    cache.mmap_name = PathBuf::from(get_str(r)?);
    cache.march = get_str(r)?;
    cache.auxinfo = get_str(r)?;
    cache.mode = get_u32(r)?;
    let u_blocks = get_u64(r)? as usize;
    let n_blocks = get_u64(r)? as usize;
    let n_objects = get_u64(r)? as usize;
    cache.cache_size = get_u64(r)? as usize;
    cache.block_size = get_u64(r)? as usize;
    cache.colsize = get_u64(r)?;

    if n_objects > MAX_CACHE_BLOCK_OBJECTS {
        return Err(CacheError::TooManyObjects {
            cache: cache.index,
            max: MAX_CACHE_BLOCK_OBJECTS,
        });
    }

    let mut objects = Vec::with_capacity(n_objects);
    for _ in 0..n_objects {
        let desc = get_str(r)?;
        let offset = get_u64(r)? as usize;
        let size = get_u64(r)? as usize;
        objects.push(ObjectSpec { desc, size, offset });
    }

    // The stream must agree with itself before we trust it.
    let sum: usize = objects.iter().map(|o| o.size).sum();
    if sum != cache.block_size || cache.cache_size != n_blocks * cache.block_size {
        return Err(CacheError::Inconsistent {
            cache: cache.index,
            reason: format!(
                "object sizes sum to {sum} but block_size is {}",
                cache.block_size
            ),
        });
    }
    let mut running = 0usize;
    for o in &objects {
        if o.offset != running {
            return Err(CacheError::Inconsistent {
                cache: cache.index,
                reason: format!("object '{}' offset {} != {running}", o.desc, o.offset),
            });
        }
        running += o.size;
    }

    let mut blocks = Vec::with_capacity(n_blocks);
    for _ in 0..n_blocks {
        blocks.push(BlockMeta {
            flags: get_u8(r)?,
            tag: get_u64(r)?,
            lifetime: get_i64(r)?,
            hubness: get_i64(r)?,
            binding: get_i64(r)?,
        });
    }

    cache.objects = objects;
    cache.n_blocks = n_blocks;
    cache.blocks = blocks;
    cache.locks = (0..n_blocks)
        .map(|_| std::sync::Arc::new(parking_lot::RwLock::new(())))
        .collect();
    cache.u_blocks = u_blocks.min(n_blocks);
    cache.crc = crc;
    cache.mapinfo_name = mapinfo_name;

    Ok(crc)
}

fn put_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

fn put_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn put_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn put_i64<W: Write>(w: &mut W, v: i64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn put_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    put_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn get_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn get_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn get_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn get_i64<R: Read>(r: &mut R) -> io::Result<i64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(i64::from_le_bytes(b))
}

fn get_str<R: Read>(r: &mut R) -> io::Result<String> {
    let len = get_u32(r)? as usize;
    if len > MAX_STRING {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("string of {len} bytes exceeds the {MAX_STRING} byte cap"),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::layout::{finalize_offsets, BLOCK_USED};

    /// A slot with non-trivial metadata in every persisted field, no mapping.
    fn populated_cache() -> Cache {
        let mut c = Cache::new(3);
        c.name = "demo".to_string();
        c.path = PathBuf::from("/tmp/pool");
        c.march = "x86_64".to_string();
        c.mode = 0b1010;
        c.objects = vec![
            ObjectSpec {
                desc: "hdr".to_string(),
                size: 16,
                offset: 0,
            },
            ObjectSpec {
                desc: "payload".to_string(),
                size: 240,
                offset: 0,
            },
        ];
        c.block_size = finalize_offsets(&mut c.objects);
        c.n_blocks = 3;
        c.cache_size = 3 * c.block_size;
        c.mmap_name = PathBuf::from("/tmp/pool/demo.mmc");
        c.mapinfo_name = PathBuf::from("/tmp/pool/demo.map");
        c.blocks = vec![
            BlockMeta {
                flags: BLOCK_USED,
                tag: 7,
                lifetime: 99,
                hubness: -3,
                binding: 12,
            },
            BlockMeta::default(),
            BlockMeta {
                flags: BLOCK_USED,
                tag: 0xdead,
                lifetime: -1,
                hubness: 5,
                binding: -8,
            },
        ];
        c.u_blocks = 2;
        c.crc = 0x1122_3344_5566_7788;
        c.colsize = 424242;
        c.auxinfo = "aux blob".to_string();
        c
    }

    #[test]
    fn round_trip_reproduces_every_field() {
        let orig = populated_cache();
        let mut buf = Vec::new();
        serialize_into(&orig, orig.mode, &mut buf).unwrap();

        let mut fresh = Cache::new(5);
        let crc = deserialize_from(&mut fresh, &mut buf.as_slice()).unwrap();

        assert_eq!(crc, orig.crc);
        assert_eq!(fresh.crc, orig.crc);
        assert_eq!(fresh.name, orig.name);
        assert_eq!(fresh.path, orig.path);
        assert_eq!(fresh.mapinfo_name, orig.mapinfo_name);
        assert_eq!(fresh.mmap_name, orig.mmap_name);
        assert_eq!(fresh.march, orig.march);
        assert_eq!(fresh.auxinfo, orig.auxinfo);
        assert_eq!(fresh.mode, orig.mode);
        assert_eq!(fresh.u_blocks, orig.u_blocks);
        assert_eq!(fresh.n_blocks, orig.n_blocks);
        assert_eq!(fresh.cache_size, orig.cache_size);
        assert_eq!(fresh.block_size, orig.block_size);
        assert_eq!(fresh.colsize, orig.colsize);
        assert_eq!(fresh.objects, orig.objects);
        assert_eq!(fresh.blocks, orig.blocks);
        assert_eq!(fresh.locks.len(), orig.n_blocks);
    }

    #[test]
    fn serialized_form_is_byte_stable() {
        let orig = populated_cache();
        let mut a = Vec::new();
        let mut b = Vec::new();
        serialize_into(&orig, orig.mode, &mut a).unwrap();
        serialize_into(&orig, orig.mode, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let orig = populated_cache();
        let mut buf = Vec::new();
        serialize_into(&orig, orig.mode, &mut buf).unwrap();
        buf[0] = 0xFE;

        let mut fresh = Cache::new(0);
        assert!(matches!(
            deserialize_from(&mut fresh, &mut buf.as_slice()),
            Err(CacheError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn truncated_stream_is_an_io_error() {
        let orig = populated_cache();
        let mut buf = Vec::new();
        serialize_into(&orig, orig.mode, &mut buf).unwrap();
        buf.truncate(buf.len() - 5);

        let mut fresh = Cache::new(0);
        assert!(matches!(
            deserialize_from(&mut fresh, &mut buf.as_slice()),
            Err(CacheError::Io(_))
        ));
    }

    #[test]
    fn inconsistent_geometry_is_rejected() {
        let mut orig = populated_cache();
        orig.block_size += 1; // no longer the sum of object sizes
        orig.cache_size = orig.n_blocks * orig.block_size;
        let mut buf = Vec::new();
        serialize_into(&orig, orig.mode, &mut buf).unwrap();

        let mut fresh = Cache::new(0);
        assert!(matches!(
            deserialize_from(&mut fresh, &mut buf.as_slice()),
            Err(CacheError::Inconsistent { .. })
        ));
    }

    #[test]
    fn mapinfo_path_derivation() {
        assert_eq!(mapinfo_path(Path::new("demo")), PathBuf::from("./demo.map"));
        assert_eq!(
            mapinfo_path(Path::new("dir/demo.mmc")),
            PathBuf::from("dir/demo.map")
        );
        assert_eq!(
            mapinfo_path(Path::new("/a/b/demo.map")),
            PathBuf::from("/a/b/demo.map")
        );
    }
}
