//! Crash-safe reading, writing and eviction of cache entries.
//!
//! The write path serializes into a private temporary directory first
//! and only copies onto the published paths while holding the entry
//! lock, so a crash mid-serialization never corrupts a published entry.
//! The read path treats any corruption as a miss: the entry is
//! recomputed and overwritten on the next call instead of surfacing an
//! error.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::entry::{scan_entries, CacheEntry};
use crate::error::CacheResult;

/// Return whether `entry` is unusable, by age or by changed dependencies.
///
/// Callers deciding whether to serve a read must hold the entry lock
/// while evaluating this, to avoid racing a concurrent writer
/// mid-publish.
pub fn is_outdated(entry: &CacheEntry, maxage: Option<Duration>) -> bool {
    is_age_outdated(entry, maxage) || is_dep_outdated(entry)
}

/// Age check: stale when the data file was last touched longer than
/// `maxage` ago. A missing data file is not an age failure; absence is
/// caught by the dependency check.
fn is_age_outdated(entry: &CacheEntry, maxage: Option<Duration>) -> bool {
    let Some(maxage) = maxage else {
        return false;
    };
    let Ok(modified) = fs::metadata(&entry.data).and_then(|m| m.modified()) else {
        return false;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age > maxage,
        // Data mtime lies in the future; treat as fresh
        Err(_) => false,
    }
}

/// Dependency check: stale when any manifest path was modified after the
/// data file, can no longer be stat'd, or the manifest itself is
/// missing or unreadable.
fn is_dep_outdated(entry: &CacheEntry) -> bool {
    let Ok(data_mtime) = fs::metadata(&entry.data).and_then(|m| m.modified()) else {
        return true;
    };
    let manifest = match fs::read_to_string(&entry.dep) {
        Ok(manifest) => manifest,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
        Err(e) => {
            tracing::warn!(dep = %entry.dep.display(), "corrupt cache dep file: {e}");
            return true;
        }
    };

    for line in manifest.lines() {
        let path = line.trim_end();
        if path.is_empty() {
            continue;
        }
        match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) if mtime > data_mtime => return true,
            Ok(_) => {}
            // A dependency that cannot be stat'd invalidates the entry
            Err(_) => return true,
        }
    }
    false
}

/// Locked read of a cache entry.
///
/// Returns `None` when the entry is stale, absent or corrupt; corruption
/// is logged and self-heals via recomputation. A successful read bumps
/// the data file's mtime, extending its age window and marking it
/// recently used for eviction ordering.
pub fn read<R: DeserializeOwned>(entry: &CacheEntry, maxage: Option<Duration>) -> Option<R> {
    let _lock = match entry.acquire_lock() {
        Ok(lock) => lock,
        Err(e) => {
            tracing::warn!(ident = %entry.ident, "failed to lock cache entry: {e}");
            return None;
        }
    };

    if is_outdated(entry, maxage) {
        return None;
    }

    let file = match File::open(&entry.data) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(data = %entry.data.display(), "failed to open cache entry: {e}");
            return None;
        }
    };
    let result = match serde_json::from_reader(BufReader::new(file)) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(data = %entry.data.display(), "corrupt cache entry: {e}");
            return None;
        }
    };

    tracing::debug!(ident = %entry.ident, "reading cache entry");
    touch(&entry.data);
    Some(result)
}

/// Bump a file's mtime to now. Best effort.
fn touch(path: &Path) {
    let refreshed = OpenOptions::new()
        .append(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()));
    if let Err(e) = refreshed {
        tracing::warn!(path = %path.display(), "failed to refresh cache entry mtime: {e}");
    }
}

/// Locked write of a cache entry.
///
/// Serializes `result` and the dependency manifest to temporary files
/// outside the cache directory, then publishes both under the entry
/// lock. The data and dependency files are always updated together.
pub fn write<R: Serialize>(entry: &CacheEntry, result: &R, deps: &[PathBuf]) -> CacheResult<()> {
    let staging = tempfile::Builder::new().prefix("anycache-").tempdir()?;
    let staged_data = staging.path().join("data");
    let staged_dep = staging.path().join("dep");

    let mut writer = BufWriter::new(File::create(&staged_data)?);
    serde_json::to_writer(&mut writer, result)?;
    writer.flush()?;

    let mut manifest = String::new();
    for dep in deps {
        manifest.push_str(&dep.to_string_lossy());
        manifest.push('\n');
    }
    fs::write(&staged_dep, manifest)?;

    tracing::debug!(ident = %entry.ident, "writing cache entry");
    let _lock = entry.acquire_lock()?;
    fs::copy(&staged_data, &entry.data)?;
    fs::copy(&staged_dep, &entry.dep)?;
    Ok(())
}

/// Locked removal of a cache entry. Idempotent: removing an entry that
/// was never created, or that a concurrent evictor already removed, is
/// not an error.
pub fn remove(entry: &CacheEntry) {
    match entry.acquire_lock() {
        Ok(_lock) => {
            for path in [&entry.data, &entry.dep] {
                if let Err(e) = fs::remove_file(path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        tracing::warn!(path = %path.display(), "failed to remove cache file: {e}");
                    }
                }
            }
            tracing::debug!(ident = %entry.ident, "removing cache entry");
        }
        Err(e) => {
            tracing::warn!(ident = %entry.ident, "failed to lock cache entry for removal: {e}");
        }
    }
}

/// Evict oldest-touched entries until the total size fits `maxsize`.
///
/// At least the two most-recently-touched entries always survive, so the
/// latest written entry (and one predecessor) is retained even when it
/// alone exceeds the budget. The enumeration is not lock-protected;
/// total-size accounting may be transiently inaccurate under heavy
/// concurrency, which is accepted in exchange for not serializing all
/// cache activity behind a global lock.
pub fn tidy_up(cache_dir: &Path, maxsize: u64) {
    let mut infos = scan_entries(cache_dir);
    let mut total: u64 = infos.iter().map(|info| info.size).sum();
    infos.sort_by_key(|info| info.mtime);

    let mut infos = VecDeque::from(infos);
    while total > maxsize && infos.len() > 2 {
        let Some(info) = infos.pop_front() else {
            break;
        };
        tracing::debug!(ident = %info.entry.ident, size = info.size, "evicting cache entry");
        remove(&info.entry);
        total = total.saturating_sub(info.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_entry(temp_dir: &TempDir, ident: &str) -> CacheEntry {
        CacheEntry::new(temp_dir.path(), ident)
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        OpenOptions::new()
            .append(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let entry = make_entry(&temp_dir, "aa");

        write(&entry, &vec![1u32, 2, 3], &[]).unwrap();
        assert!(entry.data.exists());
        assert!(entry.dep.exists());

        let value: Option<Vec<u32>> = read(&entry, None);
        assert_eq!(value, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_read_missing_entry() {
        let temp_dir = TempDir::new().unwrap();
        let entry = make_entry(&temp_dir, "aa");

        let value: Option<u32> = read(&entry, None);
        assert!(value.is_none());
    }

    #[test]
    fn test_read_corrupt_data_is_a_miss() {
        let temp_dir = TempDir::new().unwrap();
        let entry = make_entry(&temp_dir, "aa");

        write(&entry, &42u32, &[]).unwrap();
        fs::write(&entry.data, "foo").unwrap();

        let value: Option<u32> = read(&entry, None);
        assert!(value.is_none());
    }

    #[test]
    fn test_outdated_for_absent_entry() {
        let temp_dir = TempDir::new().unwrap();
        let entry = make_entry(&temp_dir, "aa");
        assert!(is_outdated(&entry, None));
    }

    #[test]
    fn test_fresh_with_empty_deps() {
        let temp_dir = TempDir::new().unwrap();
        let entry = make_entry(&temp_dir, "aa");
        write(&entry, &1u32, &[]).unwrap();
        assert!(!is_outdated(&entry, None));
    }

    #[test]
    fn test_outdated_when_dep_newer_than_data() {
        let temp_dir = TempDir::new().unwrap();
        let dep_path = temp_dir.path().join("input.txt");
        fs::write(&dep_path, "dep").unwrap();

        let entry = make_entry(&temp_dir, "aa");
        write(&entry, &1u32, &[dep_path.clone()]).unwrap();
        assert!(!is_outdated(&entry, None));

        set_mtime(&dep_path, SystemTime::now() + Duration::from_secs(10));
        assert!(is_outdated(&entry, None));
    }

    #[test]
    fn test_outdated_when_dep_vanishes() {
        let temp_dir = TempDir::new().unwrap();
        let dep_path = temp_dir.path().join("input.txt");
        fs::write(&dep_path, "dep").unwrap();

        let entry = make_entry(&temp_dir, "aa");
        write(&entry, &1u32, &[dep_path.clone()]).unwrap();
        assert!(!is_outdated(&entry, None));

        fs::remove_file(&dep_path).unwrap();
        assert!(is_outdated(&entry, None));
    }

    #[test]
    fn test_outdated_when_manifest_missing() {
        let temp_dir = TempDir::new().unwrap();
        let entry = make_entry(&temp_dir, "aa");
        write(&entry, &1u32, &[]).unwrap();

        fs::remove_file(&entry.dep).unwrap();
        assert!(is_outdated(&entry, None));
    }

    #[test]
    fn test_age_outdated() {
        let temp_dir = TempDir::new().unwrap();
        let entry = make_entry(&temp_dir, "aa");
        write(&entry, &1u32, &[]).unwrap();

        let maxage = Some(Duration::from_secs(60));
        assert!(!is_outdated(&entry, maxage));

        set_mtime(&entry.data, SystemTime::now() - Duration::from_secs(120));
        assert!(is_outdated(&entry, maxage));
    }

    #[test]
    fn test_age_missing_data_not_an_age_failure() {
        let temp_dir = TempDir::new().unwrap();
        let entry = make_entry(&temp_dir, "aa");
        assert!(!is_age_outdated(&entry, Some(Duration::from_secs(1))));
    }

    #[test]
    fn test_read_refreshes_mtime() {
        let temp_dir = TempDir::new().unwrap();
        let entry = make_entry(&temp_dir, "aa");
        write(&entry, &1u32, &[]).unwrap();

        let stale = SystemTime::now() - Duration::from_secs(3600);
        set_mtime(&entry.data, stale);

        let value: Option<u32> = read(&entry, None);
        assert_eq!(value, Some(1));

        let refreshed = fs::metadata(&entry.data).unwrap().modified().unwrap();
        assert!(refreshed > stale + Duration::from_secs(1800));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let entry = make_entry(&temp_dir, "aa");

        // Never created
        remove(&entry);

        write(&entry, &1u32, &[]).unwrap();
        remove(&entry);
        assert!(!entry.data.exists());
        assert!(!entry.dep.exists());

        // Removed twice
        remove(&entry);
    }

    #[test]
    fn test_tidy_up_keeps_two_newest() {
        let temp_dir = TempDir::new().unwrap();
        let base = SystemTime::now() - Duration::from_secs(100);

        for (i, ident) in ["aa", "bb", "cc", "dd"].iter().enumerate() {
            let entry = make_entry(&temp_dir, ident);
            write(&entry, &vec![0u8; 64], &[]).unwrap();
            set_mtime(&entry.data, base + Duration::from_secs(i as u64));
        }

        // Budget of zero: everything evictable goes, floor of two remains
        tidy_up(temp_dir.path(), 0);

        let infos = scan_entries(temp_dir.path());
        let mut idents: Vec<_> = infos.iter().map(|i| i.entry.ident.clone()).collect();
        idents.sort();
        assert_eq!(idents, ["cc", "dd"]);
    }

    #[test]
    fn test_tidy_up_respects_budget() {
        let temp_dir = TempDir::new().unwrap();
        let base = SystemTime::now() - Duration::from_secs(100);

        for (i, ident) in ["aa", "bb", "cc", "dd", "ee"].iter().enumerate() {
            let entry = make_entry(&temp_dir, ident);
            write(&entry, &vec![0u8; 16], &[]).unwrap();
            set_mtime(&entry.data, base + Duration::from_secs(i as u64));
        }

        let infos = scan_entries(temp_dir.path());
        let per_entry = infos[0].size;

        tidy_up(temp_dir.path(), 3 * per_entry);

        let remaining = scan_entries(temp_dir.path());
        assert_eq!(remaining.len(), 3);
        let total: u64 = remaining.iter().map(|i| i.size).sum();
        assert!(total <= 3 * per_entry);
    }

    #[test]
    fn test_tidy_up_unbounded_budget_removes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        for ident in ["aa", "bb", "cc"] {
            let entry = make_entry(&temp_dir, ident);
            write(&entry, &vec![0u8; 16], &[]).unwrap();
        }

        tidy_up(temp_dir.path(), u64::MAX);
        assert_eq!(scan_entries(temp_dir.path()).len(), 3);
    }
}
