//! Cache entry location and enumeration.
//!
//! Each entry is the on-disk triple `<fingerprint>.cache` (serialized
//! result), `<fingerprint>.dep` (newline-separated dependency paths) and
//! `<fingerprint>.lock` (advisory lock file), all in one cache
//! directory. The data and dependency files are updated together; an
//! entry missing either is treated as absent.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::lock::EntryLock;

/// Suffix of the serialized-result file.
pub const CACHE_SUFFIX: &str = ".cache";
/// Suffix of the dependency-manifest file.
pub const DEP_SUFFIX: &str = ".dep";
/// Suffix of the lock file.
pub const LOCK_SUFFIX: &str = ".lock";

/// File triple for one fingerprint.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The fingerprint this entry is keyed by
    pub ident: String,
    /// Serialized result file
    pub data: PathBuf,
    /// Dependency manifest file
    pub dep: PathBuf,
    /// Lock file
    pub lock: PathBuf,
}

impl CacheEntry {
    /// Derive the file triple for `ident` under `cache_dir`.
    pub fn new(cache_dir: &Path, ident: &str) -> Self {
        Self {
            ident: ident.to_string(),
            data: cache_dir.join(format!("{ident}{CACHE_SUFFIX}")),
            dep: cache_dir.join(format!("{ident}{DEP_SUFFIX}")),
            lock: cache_dir.join(format!("{ident}{LOCK_SUFFIX}")),
        }
    }

    /// Reconstruct the triple from a `*.cache` path found on disk.
    fn from_data_path(data: PathBuf) -> Option<Self> {
        let ident = data.file_stem()?.to_str()?.to_string();
        let dep = data.with_extension(DEP_SUFFIX.trim_start_matches('.'));
        let lock = data.with_extension(LOCK_SUFFIX.trim_start_matches('.'));
        Some(Self {
            ident,
            data,
            dep,
            lock,
        })
    }

    /// Acquire this entry's exclusive lock, blocking.
    pub fn acquire_lock(&self) -> io::Result<EntryLock> {
        EntryLock::acquire(&self.lock)
    }
}

/// Last-touch time and on-disk size of one entry.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    /// The entry this information belongs to
    pub entry: CacheEntry,
    /// Modification time of the data file (last written or validated)
    pub mtime: SystemTime,
    /// Data file size plus dependency file size in bytes
    pub size: u64,
}

impl EntryInfo {
    fn stat(entry: CacheEntry) -> io::Result<Self> {
        let data_meta = fs::metadata(&entry.data)?;
        let dep_meta = fs::metadata(&entry.dep)?;
        Ok(Self {
            mtime: data_meta.modified()?,
            size: data_meta.len() + dep_meta.len(),
            entry,
        })
    }
}

/// Enumerate all entries currently present in `cache_dir`.
///
/// The scan itself is not lock-protected. Entries whose files vanish
/// between listing and stat (a concurrent evictor or `remove`) are
/// skipped rather than errored.
pub fn scan_entries(cache_dir: &Path) -> Vec<EntryInfo> {
    let Ok(read) = fs::read_dir(cache_dir) else {
        return Vec::new();
    };

    let mut infos = Vec::new();
    for dir_entry in read.flatten() {
        let path = dir_entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(CACHE_SUFFIX.trim_start_matches('.'))
        {
            continue;
        }
        let Some(entry) = CacheEntry::from_data_path(path) else {
            continue;
        };
        match EntryInfo::stat(entry) {
            Ok(info) => infos.push(info),
            // Files may vanish under concurrent eviction
            Err(_) => continue,
        }
    }
    infos
}
