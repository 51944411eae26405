//! Archive helpers: bundle a cache's `.map`/`.mmc` pair into a `tar` (or
//! `tar.xz`) archive, and unpack such archives. Both shell out to the
//! external `tar`; a missing source file or a non-zero exit is an error.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{CacheError, Result};

/// Bundle `<basename>.map` + `<basename>.mmc` into `<basename>.tar` (or
/// `.tar.xz` when `compress`), optionally deleting the originals. Returns
/// the archive path.
pub fn archive(compress: bool, delete_after: bool, basename: &str) -> Result<PathBuf> {
    let (dir, stem) = split(Path::new(basename));
    let map = format!("{stem}.map");
    let mmc = format!("{stem}.mmc");

    for name in [&map, &mmc] {
        if !dir.join(name).exists() {
            return Err(CacheError::Archive(format!(
                "missing source file {}",
                dir.join(name).display()
            )));
        }
    }

    let archive_name = if compress {
        format!("{stem}.tar.xz")
    } else {
        format!("{stem}.tar")
    };

    let status = Command::new("tar")
        .arg(if compress { "-cJf" } else { "-cf" })
        .arg(&archive_name)
        .arg(&map)
        .arg(&mmc)
        .current_dir(&dir)
        .status()?;
    if !status.success() {
        return Err(CacheError::Archive(format!(
            "tar exited with {status} while creating {archive_name}"
        )));
    }

    if delete_after {
        fs::remove_file(dir.join(&map))?;
        fs::remove_file(dir.join(&mmc))?;
    }

    log::debug!("archived {stem} into {archive_name}");
    Ok(dir.join(archive_name))
}

/// Unpack a `.tar` / `.tar.xz` archive produced by [`archive`]. A bare
/// basename probes `<name>.tar` first, then `<name>.tar.xz`.
pub fn extract(name: &str) -> Result<()> {
    let given = Path::new(name);
    let target = if name.ends_with(".tar.xz") || name.ends_with(".tar") {
        given.to_path_buf()
    } else {
        let tar = PathBuf::from(format!("{name}.tar"));
        let txz = PathBuf::from(format!("{name}.tar.xz"));
        if tar.exists() {
            tar
        } else if txz.exists() {
            txz
        } else {
            return Err(CacheError::Archive(format!(
                "no archive found for '{name}' (tried .tar and .tar.xz)"
            )));
        }
    };

    if !target.exists() {
        return Err(CacheError::Archive(format!(
            "archive {} does not exist",
            target.display()
        )));
    }

    let (dir, _) = split(&target);
    let file = target
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let flag = if file.ends_with(".xz") { "-xJf" } else { "-xf" };

    let status = Command::new("tar")
        .arg(flag)
        .arg(&file)
        .current_dir(&dir)
        .status()?;
    if !status.success() {
        return Err(CacheError::Archive(format!(
            "tar exited with {status} while extracting {file}"
        )));
    }

    log::debug!("extracted {file}");
    Ok(())
}

fn split(path: &Path) -> (PathBuf, String) {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let stem = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    (dir, stem)
}
