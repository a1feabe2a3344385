//! Single-file chunk archives: a zip of the chunk directory with stored
//! (uncompressed) entries, so readers can seek straight to a table.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::errors::{IndexError, IndexResult};

/// SQLite side files that must never end up in an archive.
const TRANSIENT_SUFFIXES: &[&str] = &["-wal", "-shm", "-journal"];

fn is_transient(path: &Path) -> bool {
    let name = path.to_string_lossy();
    TRANSIENT_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Pack every file below `dir` into `out`, root-relative, in sorted order.
/// The archive is written next to `out` and renamed into place.
pub fn pack_directory(dir: &Path, out: &Path) -> IndexResult<usize> {
    let tmp = with_suffix(out, ".partial");
    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let result = write_archive(dir, &tmp);
    match result {
        Ok(count) => {
            std::fs::rename(&tmp, out)?;
            Ok(count)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn write_archive(dir: &Path, target: &Path) -> IndexResult<usize> {
    let mut writer = ZipWriter::new(BufWriter::new(File::create(target)?));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(true);
    let mut count = 0;
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() || is_transient(entry.path()) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| IndexError::Index(e.to_string()))?
            .to_string_lossy()
            .replace('\\', "/");
        writer.start_file(rel, options)?;
        io::copy(&mut File::open(entry.path())?, &mut writer)?;
        count += 1;
    }
    writer.finish()?.flush()?;
    Ok(count)
}

/// Extract `archive` into `dest`, replacing whatever was there. Entries
/// escaping the destination are rejected.
pub fn unpack_archive(archive: &Path, dest: &Path) -> IndexResult<usize> {
    let staging = with_suffix(dest, ".partial");
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;
    let count = match extract_into(archive, &staging) {
        Ok(count) => count,
        Err(e) => {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
    };
    if dest.exists() {
        std::fs::remove_dir_all(dest)?;
    }
    std::fs::rename(&staging, dest)?;
    Ok(count)
}

fn extract_into(archive: &Path, dest: &Path) -> IndexResult<usize> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    let mut count = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(rel) = entry.enclosed_name() else {
            return Err(IndexError::Index(format!(
                "archive entry {:?} escapes the chunk directory",
                entry.name()
            )));
        };
        let target = dest.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        io::copy(&mut entry, &mut File::create(&target)?)?;
        count += 1;
    }
    Ok(count)
}

/// `path` with `suffix` appended to its final component.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}
